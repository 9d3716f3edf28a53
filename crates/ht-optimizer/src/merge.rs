//! Overlaying sampled parameters onto a base configuration.
//!
//! Parameter names are dotted paths (`trainer.learning_rate`,
//! `input_features.0.encoder`). A segment addresses an object key, or an
//! array position when the container it walks into is an array.

use serde_json::Value;

use ht_types::PathError;

use crate::space::{Sample, SearchSpace};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Segment<'a> {
    Key(&'a str),
    Index(usize),
}

/// Resolve `segment` against the container it is about to enter.
fn segment_for<'a>(
    container: &Value,
    path: &str,
    parent: &str,
    segment: &'a str,
) -> Result<Segment<'a>, PathError> {
    match container {
        Value::Object(_) => Ok(Segment::Key(segment)),
        Value::Array(items) => segment
            .parse::<usize>()
            .map(Segment::Index)
            .map_err(|_| PathError::MissingSegment {
                path: path.to_string(),
                segment: segment.to_string(),
            })
            .and_then(|seg| match seg {
                Segment::Index(i) if i >= items.len() => Err(PathError::IndexOutOfBounds {
                    path: path.to_string(),
                    index: i,
                    len: items.len(),
                }),
                other => Ok(other),
            }),
        _ => Err(PathError::NotAContainer {
            path: path.to_string(),
            segment: parent.to_string(),
        }),
    }
}

/// Write `value` at `path`. Every parent segment must already exist.
fn set_path(root: &mut Value, path: &str, value: Value) -> Result<(), PathError> {
    if path.is_empty() {
        return Err(PathError::Empty);
    }
    let segments: Vec<&str> = path.split('.').collect();
    if let Some(blank) = segments.iter().find(|s| s.is_empty()) {
        return Err(PathError::MissingSegment {
            path: path.to_string(),
            segment: blank.to_string(),
        });
    }
    let Some((&leaf, parents)) = segments.split_last() else {
        return Err(PathError::Empty);
    };

    let mut node = root;
    let mut parent = "<root>";
    for &raw in parents {
        let segment = segment_for(node, path, parent, raw)?;
        let missing = || PathError::MissingSegment {
            path: path.to_string(),
            segment: raw.to_string(),
        };
        node = match (node, segment) {
            (Value::Object(map), Segment::Key(key)) => map.get_mut(key).ok_or_else(missing)?,
            (Value::Array(items), Segment::Index(i)) => items.get_mut(i).ok_or_else(missing)?,
            _ => return Err(missing()),
        };
        parent = raw;
    }

    match (segment_for(node, path, parent, leaf)?, node) {
        (Segment::Key(key), Value::Object(map)) => {
            map.insert(key.to_string(), value);
        }
        (Segment::Index(i), Value::Array(items)) => {
            items[i] = value;
        }
        _ => {
            return Err(PathError::MissingSegment {
                path: path.to_string(),
                segment: leaf.to_string(),
            })
        }
    }
    Ok(())
}

/// Produce a resolved configuration: `base` with every sampled value written
/// at its path. `base` is not modified.
pub fn merge(base: &Value, sample: &Sample) -> Result<Value, PathError> {
    let mut resolved = base.clone();
    for (path, value) in sample.iter() {
        set_path(&mut resolved, path, value.to_json())?;
    }
    Ok(resolved)
}

/// Check that every declared parameter can be written into `base`.
///
/// Performs a dry-run merge of one representative point per parameter, so
/// paths that clash with each other are caught as well.
pub fn validate_paths(base: &Value, space: &SearchSpace) -> Result<(), PathError> {
    let probe: Sample = space
        .parameters()
        .iter()
        .filter_map(|p| p.grid_point(0, 1).map(|v| (p.name().to_string(), v)))
        .collect();
    merge(base, &probe).map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::space::ParameterValue;
    use serde_json::json;

    fn base() -> Value {
        json!({
            "input_features": [
                {"name": "utterance", "encoder": "rnn", "cell_type": "lstm"}
            ],
            "combiner": {"type": "concat", "num_fc_layers": 1},
            "trainer": {"learning_rate": 0.001, "epochs": 10}
        })
    }

    #[test]
    fn empty_sample_is_identity() {
        assert_eq!(merge(&base(), &Sample::new()).unwrap(), base());
    }

    #[test]
    fn overrides_nested_keys() {
        let original = base();
        let sample = Sample::new()
            .with("trainer.learning_rate", ParameterValue::Float(0.1))
            .with("combiner.num_fc_layers", ParameterValue::Int(3))
            .with("input_features.0.cell_type", ParameterValue::Json(json!("gru")));

        let resolved = merge(&original, &sample).unwrap();
        assert_eq!(resolved["trainer"]["learning_rate"], json!(0.1));
        assert_eq!(resolved["trainer"]["epochs"], json!(10));
        assert_eq!(resolved["combiner"]["num_fc_layers"], json!(3));
        assert_eq!(resolved["input_features"][0]["cell_type"], json!("gru"));
        assert_eq!(original, base());
    }

    #[test]
    fn inserts_new_leaf_under_existing_parent() {
        let sample = Sample::new().with("trainer.batch_size", ParameterValue::Int(64));
        let resolved = merge(&base(), &sample).unwrap();
        assert_eq!(resolved["trainer"]["batch_size"], json!(64));
        assert_eq!(resolved["trainer"]["learning_rate"], json!(0.001));
    }

    #[test]
    fn merge_is_deterministic() {
        let sample = Sample::new()
            .with("trainer.learning_rate", ParameterValue::Float(0.05))
            .with("combiner.type", ParameterValue::Json(json!("sequence")));
        let a = serde_json::to_string(&merge(&base(), &sample).unwrap()).unwrap();
        let b = serde_json::to_string(&merge(&base(), &sample).unwrap()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn missing_parent_fails_closed() {
        let sample = Sample::new().with("optimizer.beta1", ParameterValue::Float(0.9));
        assert_eq!(
            merge(&base(), &sample).unwrap_err(),
            PathError::MissingSegment {
                path: "optimizer.beta1".into(),
                segment: "optimizer".into(),
            }
        );
    }

    #[test]
    fn index_errors() {
        let sample = Sample::new().with("input_features.3.encoder", ParameterValue::Json(json!("cnn")));
        assert!(matches!(
            merge(&base(), &sample),
            Err(PathError::IndexOutOfBounds { index: 3, len: 1, .. })
        ));

        let sample = Sample::new().with("input_features.first.encoder", ParameterValue::Json(json!("cnn")));
        assert!(matches!(merge(&base(), &sample), Err(PathError::MissingSegment { .. })));
    }

    #[test]
    fn scalar_is_not_a_container() {
        let sample = Sample::new().with("trainer.epochs.max", ParameterValue::Int(3));
        assert_eq!(
            merge(&base(), &sample).unwrap_err(),
            PathError::NotAContainer {
                path: "trainer.epochs.max".into(),
                segment: "epochs".into(),
            }
        );
    }

    #[test]
    fn blank_segments_are_rejected() {
        let mut value = base();
        assert_eq!(set_path(&mut value, "", json!(1)), Err(PathError::Empty));
        assert!(set_path(&mut value, "trainer..epochs", json!(1)).is_err());
    }

    #[test]
    fn validate_paths_checks_every_parameter() {
        let good = SearchSpace::new()
            .add_float("trainer.learning_rate", 0.0001, 0.1)
            .unwrap()
            .add_int("combiner.num_fc_layers", 1, 4)
            .unwrap();
        assert!(validate_paths(&base(), &good).is_ok());

        let bad = good.add_int("decoder.num_layers", 1, 2).unwrap();
        assert!(validate_paths(&base(), &bad).is_err());
    }
}

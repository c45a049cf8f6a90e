//! ParameterCodec - Task 型とパラメータ袋の相互変換

use serde_json::{Map, Value};

use super::task::Task;
use crate::domain::{GuildcastError, TaskParameters};

pub struct ParameterCodec;

impl ParameterCodec {
    /// `None` fields are left out; anything that is not a string is rejected.
    pub fn encode<T: Task>(task: &T) -> Result<TaskParameters, GuildcastError> {
        let value = serde_json::to_value(task)
            .map_err(|e| GuildcastError::InvalidParameters(format!("encode {}: {e}", T::KIND)))?;
        let Value::Object(fields) = value else {
            return Err(GuildcastError::InvalidParameters(format!(
                "{} must serialize to an object",
                T::KIND
            )));
        };

        let mut parameters = TaskParameters::new();
        for (key, value) in fields {
            match value {
                Value::String(s) => {
                    parameters.insert(key, s);
                }
                Value::Null => {}
                other => {
                    return Err(GuildcastError::InvalidParameters(format!(
                        "{}.{key} must be a string, got {other}",
                        T::KIND
                    )));
                }
            }
        }
        Ok(parameters)
    }

    pub fn decode<T: Task>(parameters: &TaskParameters) -> Result<T, GuildcastError> {
        let fields: Map<String, Value> = parameters
            .iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect();
        serde_json::from_value(Value::Object(fields))
            .map_err(|e| GuildcastError::InvalidParameters(format!("decode {}: {e}", T::KIND)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::typed::task::fixtures::{DeleteTask, ReactionTask};

    #[test]
    fn encodes_fields_under_their_wire_names() {
        let task = ReactionTask {
            message_id: "m1".into(),
            emoji: "👍".into(),
        };
        let parameters = ParameterCodec::encode(&task).unwrap();

        assert_eq!(parameters.get("messageId").map(String::as_str), Some("m1"));
        assert_eq!(parameters.get("emoji").map(String::as_str), Some("👍"));
        assert_eq!(ParameterCodec::decode::<ReactionTask>(&parameters).unwrap(), task);
    }

    #[test]
    fn absent_optional_fields_are_skipped() {
        let task = DeleteTask {
            message_id: "m1".into(),
            reason: None,
        };
        let parameters = ParameterCodec::encode(&task).unwrap();
        assert_eq!(parameters.len(), 1);
        assert_eq!(ParameterCodec::decode::<DeleteTask>(&parameters).unwrap(), task);
    }

    #[test]
    fn missing_parameter_is_invalid() {
        let err = ParameterCodec::decode::<ReactionTask>(&TaskParameters::new()).unwrap_err();
        assert!(matches!(err, GuildcastError::InvalidParameters(msg) if msg.contains("addReaction")));
    }
}

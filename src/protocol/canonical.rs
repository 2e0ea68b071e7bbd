//! 规范化 JSON 编码
//!
//! 规则：任意层级的对象键按 UTF-8 字节序升序；记号之间无空白；字符串转义与数字格式
//! 与 serde_json 一致；数组保持原顺序。同一个值在任何一方编码都得到同样的字节。

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::core::error::SignatureError;

/// 序列化为规范字节
pub fn to_canonical_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>, serde_json::Error> {
    let tree = serde_json::to_value(value)?;
    let mut out = String::new();
    write_value(&mut out, &tree)?;
    Ok(out.into_bytes())
}

fn write_value(out: &mut String, value: &Value) -> Result<(), serde_json::Error> {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => out.push_str(&n.to_string()),
        Value::String(s) => out.push_str(&serde_json::to_string(s)?),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_value(out, item)?;
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.as_bytes().cmp(b.0.as_bytes()));
            out.push('{');
            for (i, (key, item)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::to_string(key)?);
                out.push(':');
                write_value(out, item)?;
            }
            out.push('}');
        }
    }
    Ok(())
}

/// 解码规范字节；重新编码后必须逐字节相等，否则视为格式错误
pub fn from_canonical_bytes<T>(bytes: &[u8]) -> Result<T, SignatureError>
where
    T: DeserializeOwned + Serialize,
{
    let value: T = serde_json::from_slice(bytes)
        .map_err(|e| SignatureError::Malformed(format!("payload is not a task plan: {}", e)))?;
    let reencoded = to_canonical_bytes(&value)
        .map_err(|e| SignatureError::Malformed(format!("payload cannot be re-encoded: {}", e)))?;
    if reencoded != bytes {
        return Err(SignatureError::Malformed(
            "payload is not in canonical form".to_string(),
        ));
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::plan::{TaskConstraints, TaskPlan, TaskStep};
    use serde_json::json;

    #[test]
    fn test_keys_sorted_at_every_depth() {
        let v = json!({"b": 1, "a": {"z": [3, {"y": null, "x": true}], "c": "s"}});
        let bytes = to_canonical_bytes(&v).unwrap();
        assert_eq!(
            String::from_utf8(bytes).unwrap(),
            r#"{"a":{"c":"s","z":[3,{"x":true,"y":null}]},"b":1}"#
        );
    }

    #[test]
    fn test_string_escaping_and_numbers() {
        let v = json!({"t": "line\n\"q\"\u{1}é", "f": 1.5, "n": -7});
        let s = String::from_utf8(to_canonical_bytes(&v).unwrap()).unwrap();
        assert_eq!(s, "{\"f\":1.5,\"n\":-7,\"t\":\"line\\n\\\"q\\\"\\u0001é\"}");
    }

    #[test]
    fn test_plan_roundtrip_is_stable() {
        let mut params = serde_json::Map::new();
        params.insert("path".into(), json!("./demo_projects"));
        let plan = TaskPlan::new(
            vec![TaskStep::local("scan_directory", params)],
            TaskConstraints::default(),
        );
        let bytes = to_canonical_bytes(&plan).unwrap();
        let decoded: TaskPlan = from_canonical_bytes(&bytes).unwrap();
        assert_eq!(decoded, plan);
        assert_eq!(to_canonical_bytes(&decoded).unwrap(), bytes);
    }

    #[test]
    fn test_non_canonical_payload_is_malformed() {
        let plan = TaskPlan::new(vec![], TaskConstraints::default());
        let pretty = serde_json::to_vec_pretty(&plan).unwrap();
        assert!(matches!(
            from_canonical_bytes::<TaskPlan>(&pretty),
            Err(SignatureError::Malformed(_))
        ));
        assert!(matches!(
            from_canonical_bytes::<TaskPlan>(b"not json"),
            Err(SignatureError::Malformed(_))
        ));
    }
}

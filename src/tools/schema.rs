//! 工具参数 Schema：schemars 生成 + 调度前校验
//!
//! 校验交给 jsonschema：错误信息带实例路径（如 `args/inner/count`），直接作为 InvalidParameters 的原因。

use schemars::{schema_for, JsonSchema};
use serde_json::Value;

/// 由参数结构体生成 JSON Schema（去掉 $schema / title 等与 LLM 无关的字段）
pub fn schema_of<T: JsonSchema>() -> Value {
    let schema = schema_for!(T);
    let mut value = serde_json::to_value(&schema).unwrap_or_else(|_| serde_json::json!({}));
    if let Some(obj) = value.as_object_mut() {
        obj.remove("$schema");
        obj.remove("title");
    }
    value
}

/// 策略输出格式：与 LLM 规划器解析的 `{"thought": ..., "tool_calls": [...]}` 一致（仅用于 Schema 生成）
#[allow(dead_code)]
#[derive(JsonSchema)]
struct IntentFormat {
    /// 本步的推理
    pub thought: Option<String>,
    /// 本步要执行的工具调用，按顺序执行（相互独立时可并发）
    pub tool_calls: Vec<ToolCallFormat>,
}

#[allow(dead_code)]
#[derive(JsonSchema)]
struct ToolCallFormat {
    /// 工具名，如 echo、shell、finish
    pub tool: String,
    /// 工具参数，依工具的 parameters schema 而定
    pub args: serde_json::Map<String, Value>,
    /// 为 true 时必须等前一个调用完成后再执行
    pub depends_on_previous: Option<bool>,
}

/// 返回策略输出格式的 JSON Schema 字符串，可拼入 system prompt
pub fn intent_schema_json() -> String {
    serde_json::to_string_pretty(&schema_of::<IntentFormat>()).unwrap_or_default()
}

/// 按 schema 校验工具参数；失败时汇总全部违例为可读原因
///
/// `$ref` / `definitions` / `anyOf` 等组合关键字由 jsonschema 完整处理，
/// 因此嵌套结构体与 MCP 清单中的 schema 同样生效。
pub fn validate_args(schema: &Value, args: &Value) -> Result<(), String> {
    let Some(schema_obj) = schema.as_object() else {
        return Ok(());
    };
    if schema_obj.is_empty() {
        return Ok(());
    }
    // LLM 常对无参工具传 null
    let empty = Value::Object(serde_json::Map::new());
    let args = if args.is_null() && declares_type(schema, "object") {
        &empty
    } else {
        args
    };

    let validator =
        jsonschema::Validator::new(schema).map_err(|e| format!("invalid tool schema: {e}"))?;
    if validator.is_valid(args) {
        return Ok(());
    }
    let errors: Vec<String> = validator
        .iter_errors(args)
        .map(|e| {
            let path = e.instance_path.to_string();
            if path.is_empty() {
                format!("args: {e}")
            } else {
                format!("args{path}: {e}")
            }
        })
        .collect();
    Err(errors.join("; "))
}

fn declares_type(schema: &Value, ty: &str) -> bool {
    match schema.get("type") {
        Some(Value::String(s)) => s == ty,
        Some(Value::Array(types)) => types.iter().any(|t| t.as_str() == Some(ty)),
        _ => false,
    }
}

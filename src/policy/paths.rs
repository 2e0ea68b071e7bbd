//! 路径类参数识别与词法规范化
//!
//! 不访问文件系统：`~` 展开为 `$HOME`，相对路径拼到基准目录，`.` / `..` 按组件折叠。
//! 前缀比较按路径组件进行，`/tmp` 不会放行 `/tmpfoo`。

use std::path::{Component, Path, PathBuf};

use serde_json::{Map, Value};

const PATH_KEYS: [&str; 6] = ["path", "dir", "directory", "file", "root", "target_dir"];

fn is_path_key(key: &str) -> bool {
    PATH_KEYS.contains(&key) || key.ends_with("_path") || key.ends_with("_dir")
}

fn looks_like_path(value: &str) -> bool {
    value.starts_with('/')
        || value.starts_with("./")
        || value.starts_with("../")
        || value.starts_with("~/")
}

/// 收集参数里所有路径类字符串（任意嵌套深度）
pub fn path_values(params: &Map<String, Value>) -> Vec<String> {
    let mut found = Vec::new();
    for (key, value) in params {
        collect(key, value, &mut found);
    }
    found
}

fn collect(key: &str, value: &Value, found: &mut Vec<String>) {
    match value {
        Value::String(s) => {
            if is_path_key(key) || looks_like_path(s) {
                found.push(s.clone());
            }
        }
        Value::Array(items) => {
            for item in items {
                collect(key, item, found);
            }
        }
        Value::Object(map) => {
            for (k, v) in map {
                collect(k, v, found);
            }
        }
        _ => {}
    }
}

/// 词法规范化，结果总是绝对路径
pub fn normalize(raw: &str, base_dir: &Path, home: &Path) -> PathBuf {
    let expanded = if raw == "~" {
        home.to_path_buf()
    } else if let Some(rest) = raw.strip_prefix("~/") {
        home.join(rest)
    } else {
        PathBuf::from(raw)
    };
    let joined = if expanded.is_absolute() {
        expanded
    } else {
        base_dir.join(expanded)
    };

    let mut out = PathBuf::new();
    for component in joined.components() {
        match component {
            Component::Prefix(p) => out.push(p.as_os_str()),
            Component::RootDir => out.push(Component::RootDir.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            Component::Normal(part) => out.push(part),
        }
    }
    out
}

/// 按组件判断 `path` 是否落在任一前缀之下
pub fn is_under_any(path: &Path, prefixes: &[PathBuf]) -> bool {
    prefixes.iter().any(|prefix| path.starts_with(prefix))
}

use std::path::{Path, PathBuf};

pub fn normalize_command_path(value: &str) -> String {
    let trimmed = value.trim();
    for quote in ['"', '\''] {
        if let Some(inner) = trimmed
            .strip_prefix(quote)
            .and_then(|candidate| candidate.strip_suffix(quote))
        {
            return inner.trim().to_string();
        }
    }
    trimmed.to_string()
}

/// Picks the adb binary: explicit config, then `ADB_PATH`, then the SDK's platform-tools,
/// then plain `adb` from `PATH`.
pub fn resolve_adb_program(config_command_path: &str) -> String {
    let normalized = normalize_command_path(config_command_path);
    if !normalized.is_empty() && normalized != "adb" {
        return normalized;
    }
    if let Ok(path) = std::env::var("ADB_PATH") {
        let path = normalize_command_path(&path);
        if !path.is_empty() {
            return path;
        }
    }
    if let Some(candidate) = sdk_adb_candidate() {
        return candidate.to_string_lossy().to_string();
    }
    "adb".to_string()
}

fn sdk_adb_candidate() -> Option<PathBuf> {
    let sdk_root = std::env::var("ANDROID_SDK_ROOT")
        .or_else(|_| std::env::var("ANDROID_HOME"))
        .ok()?;
    let tools = PathBuf::from(sdk_root).join("platform-tools");
    ["adb", "adb.exe"]
        .iter()
        .map(|name| tools.join(name))
        .find(|candidate| candidate.is_file())
}

pub fn validate_adb_program(program: &str) -> Result<(), String> {
    if program.trim().is_empty() {
        return Err("ADB command is empty".to_string());
    }
    if program == "adb" {
        return Ok(());
    }
    let path = Path::new(program);
    if path.is_dir() {
        return Err("ADB path must point to an executable file".to_string());
    }
    if !path.exists() {
        return Err("ADB executable not found at the configured path".to_string());
    }
    Ok(())
}

/// Quotes a program path for the shell line when it contains spaces.
pub fn shell_quote_program(program: &str) -> String {
    if program.contains(char::is_whitespace) {
        format!("'{}'", program.replace('\'', "'\\''"))
    } else {
        program.to_string()
    }
}

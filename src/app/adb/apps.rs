/// Package identifiers from `pm list packages`, in enumeration order, without duplicates.
pub fn package_names(output: &str) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    for line in output.lines() {
        let Some(name) = line.trim().strip_prefix("package:").map(str::trim) else {
            continue;
        };
        if name.is_empty() || names.iter().any(|known| known == name) {
            continue;
        }
        names.push(name.to_string());
    }
    names
}

/// `pm list packages <filter>` matches substrings; only an exact hit counts as installed.
pub fn list_contains_package(output: &str, package: &str) -> bool {
    package_names(output).iter().any(|name| name == package)
}

/// On-device APK path from `pm path`. Split installs list several files; the base APK wins.
pub fn parse_pm_path_output(output: &str) -> Option<String> {
    let paths: Vec<&str> = output
        .lines()
        .map(str::trim)
        .filter_map(|line| line.strip_prefix("package:"))
        .map(str::trim)
        .filter(|path| !path.is_empty())
        .collect();
    paths
        .iter()
        .find(|path| path.ends_with("/base.apk"))
        .or_else(|| paths.first())
        .map(|path| path.to_string())
}

/// Whether a directory listing of the device's OBB root has an entry named `package`.
pub fn listing_has_entry(output: &str, package: &str) -> bool {
    output
        .split_whitespace()
        .map(|entry| entry.trim_end_matches('/'))
        .any(|entry| entry == package)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_third_party_listing_with_carriage_returns() {
        let output = "package:com.b\r\npackage:com.a\r\n\r\npackage:com.b\r\n";
        assert_eq!(package_names(output), vec!["com.b", "com.a"]);
    }

    #[test]
    fn ignores_non_package_lines() {
        let output = "WARNING: linker: something\npackage:com.a\n";
        assert_eq!(package_names(output), vec!["com.a"]);
    }

    #[test]
    fn exact_match_for_installed_check() {
        let output = "package:com.a.helper\npackage:com.ab\n";
        assert!(!list_contains_package(output, "com.a"));
        assert!(list_contains_package(output, "com.ab"));
    }

    #[test]
    fn prefers_base_apk_for_split_installs() {
        let output = "package:/data/app/~~x==/com.a-1/split_config.arm64_v8a.apk\npackage:/data/app/~~x==/com.a-1/base.apk\n";
        assert_eq!(
            parse_pm_path_output(output).as_deref(),
            Some("/data/app/~~x==/com.a-1/base.apk")
        );
        assert_eq!(
            parse_pm_path_output("package:/data/app/com.b-2/b.apk\r\n").as_deref(),
            Some("/data/app/com.b-2/b.apk")
        );
        assert_eq!(parse_pm_path_output(""), None);
    }

    #[test]
    fn obb_listing_requires_whole_entry() {
        let listing = "com.beatgames.beatsaber\ncom.other.game/\n";
        assert!(listing_has_entry(listing, "com.beatgames.beatsaber"));
        assert!(listing_has_entry(listing, "com.other.game"));
        assert!(!listing_has_entry(listing, "com.beatgames"));
    }
}

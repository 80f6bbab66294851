use std::sync::OnceLock;

use regex_lite::Regex;

const MISSING_COMMIT_MESSAGE: &str = "fetching of that commit failed";

fn commit_id_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| Regex::new(r"[0-9a-fA-F]{40}").unwrap())
}

/// The commit a failed `submodule update` could not fetch, if that is why it failed.
///
/// git reports such a failure as `Fetched in submodule path '...', but it did
/// not contain <id>. Direct fetching of that commit failed.` on either
/// stream. When both streams report one, stderr wins.
pub fn missing_commit(stdout: &[u8], stderr: &[u8]) -> Option<String> {
    [stderr, stdout].into_iter().find_map(|output| {
        let output = String::from_utf8_lossy(output);
        if !output.contains(MISSING_COMMIT_MESSAGE) {
            return None;
        }
        commit_id_regex()
            .find(&output)
            .map(|commit| commit.as_str().to_string())
    })
}

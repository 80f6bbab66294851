use std::sync::OnceLock;

use regex_lite::Regex;
use thiserror::Error;

use crate::model::identity::RepositoryIdentity;

pub mod recovery;
pub mod update;

#[derive(Error, Debug)]
pub enum SubmoduleError {
    #[error("Could not read the submodule manifest in {workdir}: exit code {code}")]
    Manifest { workdir: String, code: i32 },
    #[error("Cannot resolve the submodule url `{url}` against `{parent}`")]
    Resolution { url: String, parent: String },
    #[error("Initializing the submodules failed with exit code {code}")]
    Init { code: i32 },
    #[error(transparent)]
    Command(#[from] anyhow::Error),
}

impl SubmoduleError {
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            SubmoduleError::Manifest { code, .. } | SubmoduleError::Init { code } => Some(*code),
            _ => None,
        }
    }
}

/// One `submodule.<name>` section of a `.gitmodules` file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmoduleDeclaration {
    pub name: String,
    pub url: String,
    pub path: String,
}

fn manifest_line_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| {
        Regex::new(r"^submodule\.(?P<name>.+)\.(?P<key>url|path)=(?P<value>.*)$").unwrap()
    })
}

/// Parses the output of `git config -f .gitmodules -l`.
///
/// Declarations keep the order of their first key; a declaration without
/// both a url and a path is dropped.
pub fn parse_manifest_listing(listing: &str) -> Vec<SubmoduleDeclaration> {
    let mut entries: Vec<(String, Option<String>, Option<String>)> = Vec::new();
    for line in listing.lines() {
        let Some(captures) = manifest_line_regex().captures(line.trim_end()) else {
            continue;
        };
        let name = &captures["name"];
        let value = captures["value"].to_string();
        let index = match entries.iter().position(|(n, _, _)| n == name) {
            Some(index) => index,
            None => {
                entries.push((name.to_string(), None, None));
                entries.len() - 1
            }
        };
        match &captures["key"] {
            "url" => entries[index].1 = Some(value),
            _ => entries[index].2 = Some(value),
        }
    }
    entries
        .into_iter()
        .filter_map(|(name, url, path)| {
            Some(SubmoduleDeclaration {
                name,
                url: url?,
                path: path?,
            })
        })
        .collect()
}

fn is_relative_url(url: &str) -> bool {
    url == "." || url == ".." || url.starts_with("./") || url.starts_with("../")
}

/// Resolves a submodule url the way git does.
///
/// Absolute urls are returned unchanged. A relative url is joined to the
/// parent url taken as a directory: every `..` removes one path segment of
/// the parent and `.` is ignored. Ascending above the host of a remote url,
/// or above the root of a path, is an error.
pub fn resolve_submodule_url(parent_url: Option<&str>, url: &str) -> Result<String, SubmoduleError> {
    if !is_relative_url(url) {
        return Ok(url.to_string());
    }
    let resolution_error = || SubmoduleError::Resolution {
        url: url.to_string(),
        parent: parent_url.unwrap_or_default().to_string(),
    };
    let parent = parent_url
        .map(|parent| parent.trim().trim_end_matches('/'))
        .filter(|parent| !parent.is_empty())
        .ok_or_else(resolution_error)?;

    let (prefix, path) = split_base(parent);
    let mut segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    for component in url.split('/') {
        match component {
            "" | "." => {}
            ".." => {
                segments.pop().ok_or_else(resolution_error)?;
            }
            component => segments.push(component),
        }
    }

    let resolved = format!("{}{}", prefix, segments.join("/"));
    Ok(resolved.trim_end_matches('/').to_string())
}

/// Splits a url into the part that relative urls cannot remove and its path.
fn split_base(url: &str) -> (&str, &str) {
    if let Some(scheme_end) = url.find("://") {
        let authority_start = scheme_end + 3;
        return match url[authority_start..].find('/') {
            Some(slash) => url.split_at(authority_start + slash + 1),
            None => (url, ""),
        };
    }
    if !RepositoryIdentity::is_local_path(url) {
        if let Some(colon) = url.find(':') {
            return url.split_at(colon + 1);
        }
    }
    if let Some(path) = url.strip_prefix('/') {
        return ("/", path);
    }
    ("", url)
}

#[cfg(test)]
mod tests {
    use super::*;

    use pretty_assertions::assert_eq;

    fn resolve(parent: &str, url: &str) -> String {
        resolve_submodule_url(Some(parent), url).unwrap()
    }

    #[test]
    fn absolute_urls_pass_through() {
        for url in [
            "https://github.com/org/lib.git",
            "git@github.com:org/lib.git",
            "/srv/git/lib",
        ] {
            assert_eq!(resolve("https://host/group/app.git", url), url);
        }
        assert_eq!(
            resolve_submodule_url(None, "https://host/lib").unwrap(),
            "https://host/lib"
        );
    }

    #[test]
    fn sibling_repository() {
        assert_eq!(
            resolve("https://host/group/app.git", "../lib.git"),
            "https://host/group/lib.git"
        );
        assert_eq!(
            resolve("https://host/group/app.git/", "../lib.git/"),
            "https://host/group/lib.git"
        );
    }

    #[test]
    fn two_levels_up() {
        assert_eq!(
            resolve("https://host/group/app.git", "../../other/lib.git"),
            "https://host/other/lib.git"
        );
    }

    #[test]
    fn dot_segments() {
        assert_eq!(
            resolve("https://host/group/app", "./lib"),
            "https://host/group/app/lib"
        );
        assert_eq!(
            resolve("https://host/group/app", "../something/../lib"),
            "https://host/group/lib"
        );
    }

    #[test]
    fn scp_like_parent() {
        assert_eq!(
            resolve("git@github.com:seeraven/submodule-example", "../dmdcache"),
            "git@github.com:seeraven/dmdcache"
        );
        assert_eq!(
            resolve("https://github.com:443/seeraven/submodule-example", "../dmdcache"),
            "https://github.com:443/seeraven/dmdcache"
        );
    }

    #[test]
    fn local_parent() {
        assert_eq!(resolve("/srv/git/app", "../lib"), "/srv/git/lib");
    }

    #[test]
    fn ascending_past_the_host_is_an_error() {
        assert!(matches!(
            resolve_submodule_url(Some("https://host/app"), "../../lib"),
            Err(SubmoduleError::Resolution { .. })
        ));
        assert!(matches!(
            resolve_submodule_url(None, "../lib"),
            Err(SubmoduleError::Resolution { .. })
        ));
    }

    #[test]
    fn manifest_listing() {
        let listing = "\
submodule.lib.path=libs/lib
submodule.lib.url=../lib.git
submodule.lib.branch=main
submodule.tools/x.url=https://host/tools/x
submodule.tools/x.path=tools/x
submodule.broken.url=https://host/broken
";
        assert_eq!(
            parse_manifest_listing(listing),
            vec![
                SubmoduleDeclaration {
                    name: "lib".to_string(),
                    url: "../lib.git".to_string(),
                    path: "libs/lib".to_string(),
                },
                SubmoduleDeclaration {
                    name: "tools/x".to_string(),
                    url: "https://host/tools/x".to_string(),
                    path: "tools/x".to_string(),
                },
            ]
        );
    }
}

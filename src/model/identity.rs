use std::{fmt::Display, path::PathBuf, sync::OnceLock};

use regex_lite::{Captures, Regex};

use super::IdentityError;

/// The canonical form of a remote repository url, used as the cache key.
///
/// Scheme, user name, credentials, host case, trailing slashes and a trailing
/// `.git` do not take part in the identity, so `https://user@Host/org/repo.git`
/// and `git@host:org/repo` are the same repository. An explicit port does.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Ord, PartialOrd)]
pub struct RepositoryIdentity {
    pub host: String,
    pub port: Option<String>,
    pub segments: Vec<String>,
}

fn scheme_url_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| {
        Regex::new(
            r"^(?P<scheme>[A-Za-z][A-Za-z0-9+.-]*)://(?:(?P<user>[^@/]*)@)?(?P<host>\[[^\]/]*\]|[^/:@\[]*)(?::(?P<port>[0-9]*))?(?P<path>/.*)?$",
        )
        .unwrap()
    })
}

fn scp_like_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| {
        Regex::new(r"^(?:(?P<user>[^@/:]+)@)?(?P<host>\[[^\]/]*\]|[^/:@\[]+):(?P<path>.*)$")
            .unwrap()
    })
}

impl RepositoryIdentity {
    pub fn parse(url: &str) -> Result<RepositoryIdentity, IdentityError> {
        let url = url.trim();
        if url.is_empty() {
            return Err(IdentityError::Empty);
        }
        if url.chars().any(char::is_whitespace) {
            return Err(IdentityError::Malformed(url.to_string()));
        }

        if url.contains("://") {
            let captures = scheme_url_regex()
                .captures(url)
                .ok_or_else(|| IdentityError::Malformed(url.to_string()))?;
            let scheme = captures
                .name("scheme")
                .map(|s| s.as_str().to_ascii_lowercase())
                .unwrap_or_default();
            if scheme == "file" {
                return Err(IdentityError::LocalPath(url.to_string()));
            }
            return Self::from_captures(url, &captures);
        }

        if Self::is_local_path(url) {
            return Err(IdentityError::LocalPath(url.to_string()));
        }

        let captures = scp_like_regex()
            .captures(url)
            .ok_or_else(|| IdentityError::LocalPath(url.to_string()))?;
        Self::from_captures(url, &captures)
    }

    /// Whether `url` is a filesystem path rather than a remote location.
    pub fn is_local_path(url: &str) -> bool {
        if url.starts_with('/') || url.starts_with('.') || url.starts_with('\\') {
            return true;
        }
        if url.contains("://") {
            return url.to_ascii_lowercase().starts_with("file://");
        }
        // Without a colon before the first slash git reads the url as a path,
        // and a single letter before the colon is a drive letter.
        match (url.find(':'), url.find('/')) {
            (None, _) => true,
            (Some(colon), Some(slash)) if slash < colon => true,
            (Some(1), _) => true,
            _ => false,
        }
    }

    fn from_captures(url: &str, captures: &Captures<'_>) -> Result<Self, IdentityError> {
        let host = captures
            .name("host")
            .map(|s| s.as_str().to_ascii_lowercase())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| {
                IdentityError::MissingUrlComponent("host".to_string(), url.to_string())
            })?;
        let port = captures
            .name("port")
            .map(|s| s.as_str().to_string())
            .filter(|s| !s.is_empty());
        let path = captures.name("path").map(|s| s.as_str()).unwrap_or("");

        let mut segments = Vec::new();
        for segment in path.split('/') {
            match segment {
                "" | "." => {}
                ".." => return Err(IdentityError::ParentSegment(url.to_string())),
                segment => segments.push(segment.to_string()),
            }
        }
        if let Some(last) = segments.last_mut() {
            if let Some(stripped) = last.strip_suffix(".git") {
                *last = stripped.to_string();
            }
        }
        segments.retain(|segment| !segment.is_empty());
        if segments.is_empty() {
            return Err(IdentityError::MissingUrlComponent(
                "path".to_string(),
                url.to_string(),
            ));
        }

        Ok(RepositoryIdentity {
            host: host.replace([':', '[', ']'], "_"),
            port,
            segments,
        })
    }

    /// The host part of the key, `<host>` or `<host>_<port>`.
    fn host_key(&self) -> String {
        match &self.port {
            Some(port) => format!("{}_{}", self.host, port),
            None => self.host.clone(),
        }
    }

    pub fn key(&self) -> String {
        let mut key = self.host_key();
        for segment in &self.segments {
            key.push('/');
            key.push_str(segment);
        }
        key
    }

    /// Relative location of the mirror of this repository inside the mirror storage.
    pub fn to_path(&self) -> PathBuf {
        let mut result = PathBuf::new();
        result.push(self.host_key());
        for segment in &self.segments {
            result.push(segment);
        }
        result
    }
}

impl Display for RepositoryIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str(&self.key())
    }
}

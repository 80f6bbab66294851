use thiserror::Error;

pub mod identity;
pub mod options;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IdentityError {
    #[error("Repository url is empty")]
    Empty,
    #[error("Repository url `{0}` refers to the local filesystem")]
    LocalPath(String),
    #[error("Malformed repository url `{0}`")]
    Malformed(String),
    #[error("Missing url component `{0}` in string `{1}`")]
    MissingUrlComponent(String, String),
    #[error("Repository url `{0}` must not contain `..` segments")]
    ParentSegment(String),
}

use camino::Utf8PathBuf;
use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum GreylistError {
    #[error("Failed to read list file {path}")]
    #[diagnostic(code(greylist::list_file))]
    ListFile {
        path: Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid IP address '{entry}' at {path}:{line}")]
    #[diagnostic(
        code(greylist::invalid_entry),
        help("list one IP address per line, lines starting with # are ignored")
    )]
    InvalidEntry {
        path: Utf8PathBuf,
        line: usize,
        entry: String,
    },

    #[error("Invalid configuration: {0}")]
    #[diagnostic(code(greylist::config))]
    Config(String),
}

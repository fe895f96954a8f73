use colored::Colorize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FileError {
    #[error("failed to open {}", .filename.bright_yellow().bold())]
    CannotOpen { source: std::io::Error, filename: String },

    #[error("while creating {filename}")]
    WhileCreating { source: std::io::Error, filename: String },

    #[error("invalid filename: {}", .0.yellow().bold())]
    InvalidFilename(String),
}

#[derive(Error, Debug)]
pub enum GrammarError {
    #[error("malformed transfer token {}", .0.yellow().bold())]
    MalformedTransfer(String),

    #[error("species tree is not binary at {} (children: {})", .node.yellow().bold(), .children.join(" "))]
    NonBinaryNode { node: String, children: Vec<String> },
}

#[derive(Error, Debug)]
pub enum RecParseError {
    #[error("{} section missing from reconciliation file", .0.yellow().bold())]
    SectionMissing(&'static str),

    #[error("unannotated node #{0} in reconciled gene tree")]
    UnannotatedNode(usize),

    #[error("reference tree topology differs from the reconciliation species tree")]
    TopologyMismatch,

    #[error("erroneous line in node frequency table: {}", .0.yellow().bold())]
    ErroneousFrequencyLine(String),
}

#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("species {} not found in the provided species tree", .0.yellow().bold())]
    SpeciesNotFound(String),

    #[error("event {} not found in the reference event table", .0.yellow().bold())]
    UnknownEvent(String),

    #[error("no output selected; use at least one of --dir-table-out, --events-to-json, --events-to-db")]
    NoOutputSelected,
}

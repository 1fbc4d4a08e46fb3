//! Tessera ingest subsystem: archive expansion, parser dispatch and the vault facade
//!
//! Import path: InputFile → LeafWalker (zip / tar.gz / gz) → parse_file (ProviderRules) → Writer → commit
//! Control path: Vault ← ImportWorker (queued jobs) ← CLI

#![warn(missing_docs)]

pub mod cli;
pub mod config;
pub mod configured;
pub mod container;
pub mod decode;
pub mod error;
pub mod ingest;
pub mod parse;
pub mod registry;
pub mod rules;
pub mod stream;
pub mod time;
pub mod tokenize;
pub mod vault;
pub mod worker;

pub use config::VaultConfig;
pub use configured::{ConfiguredCategory, MetadataSpec, ProfileSpec, ProviderSpec, TimeFormat, TimelineSpec, TokenizerSpec};
pub use container::{ContainerKind, ExpandLimits, Payload, WorkItem};
pub use decode::{smart_decode, smart_decode_text};
pub use error::{DecodeError, IngestError, IngestResult};
pub use ingest::{FailedInput, ImportReport, IngestOptions, Ingestor, InputFile, ProgressFn};
pub use parse::{parse_file, ParseOutcome};
pub use registry::{ImportRequest, ProviderImporter, ProviderRegistry};
pub use rules::{Glob, MetadataRule, ProfileRule, ProviderRules, TimelineRule, Tokenizer};
pub use time::EventTime;
pub use vault::Vault;
pub use worker::{ImportWorker, JobHandle, WorkerConfig};

#[cfg(test)]
pub(crate) mod test_support {
    use std::io::Write;

    use tessera_store::Category;
    use zip::write::SimpleFileOptions;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum Kind {
        Activity,
        Message,
    }

    impl Category for Kind {
        fn as_tag(&self) -> &str {
            match self {
                Kind::Activity => "activity",
                Kind::Message => "message",
            }
        }

        fn from_tag(tag: &str) -> Option<Self> {
            match tag {
                "activity" => Some(Kind::Activity),
                "message" => Some(Kind::Message),
                _ => None,
            }
        }
    }

    pub fn zip_of(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
        for (name, data) in entries {
            writer.start_file(*name, SimpleFileOptions::default()).unwrap();
            writer.write_all(data).unwrap();
        }
        writer.finish().unwrap().into_inner()
    }
}

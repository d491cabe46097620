//! The bytecode artifact: the contract between the emitter and the VM.
//!
//! On disk the artifact is a fixed binary preamble (magic, format version,
//! body length) followed by a `serde_json` body. Serialization is
//! deterministic (ordered structs, no maps), so compiling the same source
//! twice yields byte-identical artifacts apart from `created_at`, and a
//! load/store cycle re-serializes identically.

use std::io::{Read, Write};

use serde::{Deserialize, Serialize};

use crate::compiler::{Constant, Op};
use crate::error::ArtifactError;
use crate::types::Ty;

pub const MAGIC: &[u8; 4] = b"DRBC";
pub const FORMAT_VERSION: u16 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub format_version: u16,
    pub metadata: ArtifactMetadata,
    pub constants: Vec<Constant>,
    pub record_schemas: Vec<RecordSchema>,
    pub modules: Vec<ModuleEntry>,
    pub endpoints: Vec<EndpointEntry>,
    pub instructions: Vec<Op>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactMetadata {
    pub source_file: String,
    pub compiler_version: String,
    /// Epoch seconds.
    pub created_at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordSchema {
    pub name: String,
    pub fields: Vec<FieldSchema>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSchema {
    pub name: String,
    pub ty: Ty,
    pub annotations: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleEntry {
    pub name: String,
    pub actions: Vec<ActionEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionEntry {
    pub name: String,
    pub params: Vec<ParamEntry>,
    /// `None` for tasks.
    pub returns: Option<Ty>,
    /// Entry offset as an instruction index.
    pub entry: u32,
    pub locals: u16,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamEntry {
    pub name: String,
    pub ty: Ty,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointEntry {
    /// `GET`, `POST`, `PUT` or `DELETE`.
    pub method: String,
    /// As written, e.g. `/users/:id`.
    pub path_template: String,
    /// `:param` names in template order.
    pub path_params: Vec<String>,
    /// Handler entry as an instruction index.
    pub handler_entry: u32,
}

impl Artifact {
    pub fn to_bytes(&self) -> Result<Vec<u8>, ArtifactError> {
        let body = serde_json::to_vec(self)?;
        let mut out = Vec::with_capacity(body.len() + 10);
        out.extend_from_slice(MAGIC);
        out.extend_from_slice(&self.format_version.to_le_bytes());
        out.extend_from_slice(&(body.len() as u32).to_le_bytes());
        out.extend_from_slice(&body);
        Ok(out)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ArtifactError> {
        if bytes.len() < 10 {
            return Err(ArtifactError::Truncated("shorter than the preamble"));
        }
        if &bytes[0..4] != MAGIC {
            return Err(ArtifactError::BadMagic);
        }
        let version = u16::from_le_bytes([bytes[4], bytes[5]]);
        if version != FORMAT_VERSION {
            return Err(ArtifactError::UnsupportedVersion(version));
        }
        let len = u32::from_le_bytes([bytes[6], bytes[7], bytes[8], bytes[9]]) as usize;
        let body = bytes
            .get(10..10 + len)
            .ok_or(ArtifactError::Truncated("body shorter than its declared length"))?;
        let artifact: Artifact = serde_json::from_slice(body)?;
        if artifact.format_version != version {
            return Err(ArtifactError::UnsupportedVersion(artifact.format_version));
        }
        Ok(artifact)
    }

    pub fn write_to(&self, writer: &mut impl Write) -> Result<(), ArtifactError> {
        let bytes = self.to_bytes()?;
        writer.write_all(&bytes)?;
        Ok(())
    }

    pub fn read_from(reader: &mut impl Read) -> Result<Self, ArtifactError> {
        let mut bytes = Vec::new();
        reader.read_to_end(&mut bytes)?;
        Self::from_bytes(&bytes)
    }

    /// Look up an action entry by table indices.
    pub fn action(&self, module: u16, action: u16) -> Option<&ActionEntry> {
        self.modules
            .get(module as usize)?
            .actions
            .get(action as usize)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn sample() -> Artifact {
        Artifact {
            format_version: FORMAT_VERSION,
            metadata: ArtifactMetadata {
                source_file: "main.droe".into(),
                compiler_version: "0.1.0".into(),
                created_at: 1_700_000_000,
            },
            constants: vec![
                Constant::Int(42),
                Constant::Decimal(123_456),
                Constant::Text("hello".into()),
                Constant::Flag(true),
                Constant::Date("2024-12-31".into()),
                Constant::Pattern("#,##0.00".into()),
            ],
            record_schemas: vec![RecordSchema {
                name: "User".into(),
                fields: vec![FieldSchema {
                    name: "id".into(),
                    ty: Ty::Text,
                    annotations: vec!["key".into(), "auto".into()],
                }],
            }],
            modules: vec![ModuleEntry {
                name: String::new(),
                actions: vec![ActionEntry {
                    name: "add".into(),
                    params: vec![
                        ParamEntry { name: "a".into(), ty: Ty::Int },
                        ParamEntry { name: "b".into(), ty: Ty::Int },
                    ],
                    returns: Some(Ty::Int),
                    entry: 3,
                    locals: 2,
                }],
            }],
            endpoints: vec![EndpointEntry {
                method: "GET".into(),
                path_template: "/users/:id".into(),
                path_params: vec!["id".into()],
                handler_entry: 9,
            }],
            instructions: vec![Op::PushConst(0), Op::Display, Op::Halt],
        }
    }

    #[test]
    fn round_trip_preserves_everything() {
        let artifact = sample();
        let bytes = artifact.to_bytes().unwrap();
        let loaded = Artifact::from_bytes(&bytes).unwrap();
        assert_eq!(loaded, artifact);
    }

    #[test]
    fn reserialization_is_byte_identical() {
        let bytes = sample().to_bytes().unwrap();
        let reloaded = Artifact::from_bytes(&bytes).unwrap();
        assert_eq!(reloaded.to_bytes().unwrap(), bytes);
    }

    #[test]
    fn bad_magic_rejected() {
        let mut bytes = sample().to_bytes().unwrap();
        bytes[0] = b'X';
        assert!(matches!(Artifact::from_bytes(&bytes), Err(ArtifactError::BadMagic)));
    }

    #[test]
    fn unknown_version_rejected() {
        let mut bytes = sample().to_bytes().unwrap();
        bytes[4] = 0xFF;
        bytes[5] = 0xFF;
        assert!(matches!(
            Artifact::from_bytes(&bytes),
            Err(ArtifactError::UnsupportedVersion(0xFFFF))
        ));
    }

    #[test]
    fn truncated_body_rejected() {
        let bytes = sample().to_bytes().unwrap();
        assert!(matches!(
            Artifact::from_bytes(&bytes[..bytes.len() - 4]),
            Err(ArtifactError::Truncated(_))
        ));
    }
}

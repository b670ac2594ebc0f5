//! Artifact domain types
//!
//! Artifacts are the data handed from one stage to the next. They are addressed
//! by `(stage, slot)` rather than by content, so re-running a stage replaces
//! what it previously produced.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// Pseudo stage that holds the retrieved source bundle.
///
/// It is populated before stage 0 runs, so any stage may consume it.
pub const SOURCE_STAGE: &str = "source";

/// Slot of the source bundle inside [`SOURCE_STAGE`]
pub const SOURCE_SLOT: &str = "bundle";

/// Kind of data an artifact carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ArtifactKind {
    Source,
    ImageRef,
    Manifest,
}

impl ArtifactKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactKind::Source => "source",
            ArtifactKind::ImageRef => "image-ref",
            ArtifactKind::Manifest => "manifest",
        }
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ArtifactKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "source" => Ok(ArtifactKind::Source),
            "image-ref" => Ok(ArtifactKind::ImageRef),
            "manifest" => Ok(ArtifactKind::Manifest),
            other => Err(format!(
                "unknown artifact kind '{}' (expected source, image-ref or manifest)",
                other
            )),
        }
    }
}

/// Error returned when an artifact reference string is malformed
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid artifact reference '{0}': expected '<stage>/<slot>'")]
pub struct InvalidArtifactRef(pub String);

/// Address of an artifact: the stage that produces it and the slot it occupies
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub stage: String,
    pub slot: String,
}

impl ArtifactRef {
    pub fn new(stage: impl Into<String>, slot: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            slot: slot.into(),
        }
    }

    /// Reference to the retrieved source bundle
    pub fn source() -> Self {
        Self::new(SOURCE_STAGE, SOURCE_SLOT)
    }

    pub fn is_source(&self) -> bool {
        self.stage == SOURCE_STAGE
    }

    /// Parses a `"<stage>/<slot>"` string
    pub fn parse(input: &str) -> Result<Self, InvalidArtifactRef> {
        match input.split_once('/') {
            Some((stage, slot))
                if !stage.is_empty() && !slot.is_empty() && !slot.contains('/') =>
            {
                Ok(Self::new(stage, slot))
            }
            _ => Err(InvalidArtifactRef(input.to_string())),
        }
    }
}

impl fmt::Display for ArtifactRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.stage, self.slot)
    }
}

/// Output slot declared by an action
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputSlot {
    pub slot: String,
    pub kind: ArtifactKind,
}

/// Descriptor crossing the build -> deploy boundary
///
/// This is the only payload a deploy action consumes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageDescriptor {
    pub service_name: String,
    pub image_uri: String,
}

/// Retrieved source tree, pinned to a revision
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceBundle {
    pub repository: String,
    pub branch: String,
    pub revision: String,
    /// Local checkout directory
    pub path: String,
}

/// Artifact content
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ArtifactPayload {
    Source(SourceBundle),
    Image(ImageDescriptor),
    Manifest { document: serde_json::Value },
}

impl ArtifactPayload {
    pub fn kind(&self) -> ArtifactKind {
        match self {
            ArtifactPayload::Source(_) => ArtifactKind::Source,
            ArtifactPayload::Image(_) => ArtifactKind::ImageRef,
            ArtifactPayload::Manifest { .. } => ArtifactKind::Manifest,
        }
    }
}

/// An artifact written to the store
///
/// Immutable once written. A later write to the same reference replaces it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub id: Uuid,
    pub reference: ArtifactRef,
    pub produced_by_action: String,
    pub run_id: Uuid,
    /// Version derived from the input identity (usually the source revision)
    pub version: String,
    pub payload: ArtifactPayload,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl Artifact {
    pub fn new(
        reference: ArtifactRef,
        produced_by_action: impl Into<String>,
        run_id: Uuid,
        version: impl Into<String>,
        payload: ArtifactPayload,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            reference,
            produced_by_action: produced_by_action.into(),
            run_id,
            version: version.into(),
            payload,
            created_at: chrono::Utc::now(),
        }
    }

    pub fn kind(&self) -> ArtifactKind {
        self.payload.kind()
    }

    pub fn produced_by_stage(&self) -> &str {
        &self.reference.stage
    }

    pub fn as_image(&self) -> Option<&ImageDescriptor> {
        match &self.payload {
            ArtifactPayload::Image(image) => Some(image),
            _ => None,
        }
    }

    pub fn as_source(&self) -> Option<&SourceBundle> {
        match &self.payload {
            ArtifactPayload::Source(bundle) => Some(bundle),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_artifact_ref() {
        let reference = ArtifactRef::parse("build/image").unwrap();
        assert_eq!(reference.stage, "build");
        assert_eq!(reference.slot, "image");
        assert_eq!(reference.to_string(), "build/image");
    }

    #[test]
    fn test_parse_artifact_ref_rejects_malformed() {
        assert!(ArtifactRef::parse("build").is_err());
        assert!(ArtifactRef::parse("/image").is_err());
        assert!(ArtifactRef::parse("build/").is_err());
        assert!(ArtifactRef::parse("a/b/c").is_err());
    }

    #[test]
    fn test_source_ref() {
        let reference = ArtifactRef::source();
        assert!(reference.is_source());
        assert_eq!(reference.to_string(), "source/bundle");
    }

    #[test]
    fn test_artifact_kind_from_str() {
        assert_eq!("image-ref".parse::<ArtifactKind>(), Ok(ArtifactKind::ImageRef));
        assert_eq!("manifest".parse::<ArtifactKind>(), Ok(ArtifactKind::Manifest));
        assert!("binary".parse::<ArtifactKind>().is_err());
    }

    #[test]
    fn test_image_descriptor_wire_format() {
        let descriptor = ImageDescriptor {
            service_name: "svc".to_string(),
            image_uri: "registry/svc:abc123def".to_string(),
        };

        let json = serde_json::to_value(&descriptor).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"serviceName": "svc", "imageUri": "registry/svc:abc123def"})
        );
    }
}

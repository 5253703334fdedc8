//! Exercise records: the dataset element shape and its normalized form

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// One element of the source dataset, as published
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawExercise {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub force: Option<String>,
    #[serde(default)]
    pub level: Option<String>,
    #[serde(default)]
    pub mechanic: Option<String>,
    #[serde(default)]
    pub equipment: Option<String>,
    #[serde(default)]
    pub primary_muscles: Vec<String>,
    #[serde(default)]
    pub secondary_muscles: Vec<String>,
    #[serde(default)]
    pub instructions: Vec<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub images: Vec<String>,
}

/// Import-owned attributes of an exercise
///
/// Anything not listed here (annotations, local edits) belongs to the
/// rest of the application and is never touched by an import.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExerciseAttributes {
    pub name: String,
    pub force: Option<String>,
    pub level: Option<String>,
    pub mechanic: Option<String>,
    pub equipment: Option<String>,
    pub category: Option<String>,
    pub primary_muscles: Vec<String>,
    pub secondary_muscles: Vec<String>,
    pub instructions: Vec<String>,
    pub images: Vec<String>,
}

impl ExerciseAttributes {
    /// Stable SHA-256 over the serialized attributes
    pub fn content_hash(&self) -> String {
        // Field order is fixed by the struct, so the JSON is canonical.
        let bytes = serde_json::to_vec(self).unwrap_or_default();
        hex::encode(Sha256::digest(&bytes))
    }

    /// Names of the attributes that differ from `other`
    pub fn changed_fields(&self, other: &ExerciseAttributes) -> Vec<&'static str> {
        let mut changed = Vec::new();
        if self.name != other.name {
            changed.push("name");
        }
        if self.force != other.force {
            changed.push("force");
        }
        if self.level != other.level {
            changed.push("level");
        }
        if self.mechanic != other.mechanic {
            changed.push("mechanic");
        }
        if self.equipment != other.equipment {
            changed.push("equipment");
        }
        if self.category != other.category {
            changed.push("category");
        }
        if self.primary_muscles != other.primary_muscles {
            changed.push("primary_muscles");
        }
        if self.secondary_muscles != other.secondary_muscles {
            changed.push("secondary_muscles");
        }
        if self.instructions != other.instructions {
            changed.push("instructions");
        }
        if self.images != other.images {
            changed.push("images");
        }
        changed
    }
}

/// Normalized exercise ready for upsert
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExerciseRecord {
    /// Natural key from the dataset
    pub external_id: String,
    pub attributes: ExerciseAttributes,
}

/// Turns raw dataset elements into [`ExerciseRecord`]s
#[derive(Debug, Clone, Default)]
pub struct Normalizer {
    media_base_url: Option<String>,
}

impl Normalizer {
    pub fn new(media_base_url: Option<String>) -> Self {
        let media_base_url = media_base_url
            .map(|url| url.trim().trim_end_matches('/').to_string())
            .filter(|url| !url.is_empty());
        Self { media_base_url }
    }

    /// Validate and normalize; the error string is the record-level reason
    pub fn normalize(&self, raw: RawExercise) -> Result<ExerciseRecord, String> {
        let external_id = raw.id.trim().to_string();
        if external_id.is_empty() {
            return Err("field `id` is empty".to_string());
        }

        let name = raw.name.trim().to_string();
        if name.is_empty() {
            return Err("field `name` is empty".to_string());
        }

        Ok(ExerciseRecord {
            external_id,
            attributes: ExerciseAttributes {
                name,
                force: keyword(raw.force),
                level: keyword(raw.level),
                mechanic: keyword(raw.mechanic),
                equipment: keyword(raw.equipment),
                category: keyword(raw.category),
                primary_muscles: keywords(raw.primary_muscles),
                secondary_muscles: keywords(raw.secondary_muscles),
                instructions: raw
                    .instructions
                    .into_iter()
                    .map(|step| step.trim().to_string())
                    .filter(|step| !step.is_empty())
                    .collect(),
                images: raw
                    .images
                    .into_iter()
                    .filter_map(|image| self.media_url(&image))
                    .collect(),
            },
        })
    }

    fn media_url(&self, image: &str) -> Option<String> {
        let image = image.trim();
        if image.is_empty() {
            return None;
        }
        if image.starts_with("http://") || image.starts_with("https://") {
            return Some(image.to_string());
        }
        Some(match &self.media_base_url {
            Some(base) => format!("{}/{}", base, image.trim_start_matches('/')),
            None => image.to_string(),
        })
    }
}

fn keyword(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_lowercase())
        .filter(|v| !v.is_empty())
}

fn keywords(values: Vec<String>) -> Vec<String> {
    values
        .into_iter()
        .filter_map(|v| keyword(Some(v)))
        .collect()
}

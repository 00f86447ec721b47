use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::vendor::{EndpointDescriptor, Period, ProfileSnapshot};

/// Reserved top-level key holding the vendor profile snapshot.
pub const PROFILE_KEY: &str = "profile";

/// The accumulated dataset for one member, persisted as a single JSON file.
///
/// Top-level keys are endpoint names plus [`PROFILE_KEY`]. Period endpoints
/// map to an object of bucket key → vendor payload; period-none endpoints map
/// straight to the payload.
#[derive(Debug, Clone, PartialEq)]
pub struct MergedDocument {
    root: Map<String, Value>,
}

impl MergedDocument {
    /// One empty object per catalog endpoint and no profile.
    pub fn skeleton(catalog: &[EndpointDescriptor]) -> Self {
        let root = catalog
            .iter()
            .map(|ep| (ep.name.to_string(), Value::Object(Map::new())))
            .collect();
        Self { root }
    }

    /// Adopt a previously uploaded document. Endpoints the file does not know
    /// about are added empty; a period endpoint whose entry is not an object
    /// is reset so buckets can be stored under it.
    pub fn from_value(value: Value, catalog: &[EndpointDescriptor]) -> Result<Self> {
        let Value::Object(mut root) = value else {
            return Err(Error::ExistingData(
                "stored document is not a JSON object".into(),
            ));
        };

        for ep in catalog {
            match root.get(ep.name) {
                None => {
                    root.insert(ep.name.to_string(), Value::Object(Map::new()));
                }
                Some(Value::Object(_)) => {}
                Some(_) if ep.period != Period::None => {
                    log::warn!("Stored entry for {} is not an object, resetting it", ep.name);
                    root.insert(ep.name.to_string(), Value::Object(Map::new()));
                }
                Some(_) => {}
            }
        }
        Ok(Self { root })
    }

    /// Discard everything, including the profile, and start from the skeleton.
    pub fn reset(&mut self, catalog: &[EndpointDescriptor]) {
        *self = Self::skeleton(catalog);
    }

    /// `encodedId` of the stored profile, if any.
    pub fn profile_id(&self) -> Option<&str> {
        self.root
            .get(PROFILE_KEY)?
            .get("encodedId")?
            .as_str()
    }

    pub fn set_profile(&mut self, profile: &ProfileSnapshot) -> Result<()> {
        self.root.insert(PROFILE_KEY.to_string(), profile.to_value()?);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.root.get(name)
    }

    /// Replace a whole entry (period-none endpoints).
    pub fn set_entry(&mut self, name: &str, value: Value) {
        self.root.insert(name.to_string(), value);
    }

    /// Stored buckets of a period endpoint.
    pub fn buckets(&self, name: &str) -> Option<&Map<String, Value>> {
        self.root.get(name)?.as_object()
    }

    /// Store one bucket, creating the endpoint's object if needed.
    pub fn set_bucket(&mut self, name: &str, key: &str, value: Value) {
        let entry = self
            .root
            .entry(name.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !entry.is_object() {
            *entry = Value::Object(Map::new());
        }
        if let Value::Object(buckets) = entry {
            buckets.insert(key.to_string(), value);
        }
    }

    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.root)?)
    }
}

//! Artifacts: datasets, models and other stored objects passed between steps.

use std::fmt;
use std::str::FromStr;

use pai_types::{PaiError, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::variable::{
    insert_binding, read_binding, PipelineVariable, VariableCategory, VariableCore, VariableKind,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "&'static str")]
pub enum DataType {
    DataSet,
    Model,
    /// Compatible with every other data type.
    Any,
}

impl DataType {
    pub fn as_str(self) -> &'static str {
        match self {
            DataType::DataSet => "DataSet",
            DataType::Model => "Model",
            DataType::Any => "Any",
        }
    }
}

impl FromStr for DataType {
    type Err = PaiError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "DataSet" => Ok(DataType::DataSet),
            "Model" => Ok(DataType::Model),
            "Any" => Ok(DataType::Any),
            _ => Err(PaiError::InvalidValue {
                target: "artifact data type".into(),
                value: s.to_string(),
            }),
        }
    }
}

impl TryFrom<String> for DataType {
    type Error = PaiError;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<DataType> for &'static str {
    fn from(t: DataType) -> Self {
        t.as_str()
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where an artifact lives, in the service's spelling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "&'static str")]
pub enum LocationType {
    Oss,
    MaxComputeTable,
    MaxComputeVolume,
    MaxComputeOfflineModel,
    Nas,
    Unknown,
}

impl LocationType {
    pub fn as_str(self) -> &'static str {
        match self {
            LocationType::Oss => "OSS",
            LocationType::MaxComputeTable => "MaxComputeTable",
            LocationType::MaxComputeVolume => "MaxComputeVolume",
            LocationType::MaxComputeOfflineModel => "MaxComputeOfflineModel",
            LocationType::Nas => "NAS",
            LocationType::Unknown => "Unknown",
        }
    }
}

impl FromStr for LocationType {
    type Err = PaiError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "OSS" => Ok(LocationType::Oss),
            "MaxComputeTable" => Ok(LocationType::MaxComputeTable),
            "MaxComputeVolume" => Ok(LocationType::MaxComputeVolume),
            "MaxComputeOfflineModel" => Ok(LocationType::MaxComputeOfflineModel),
            "NAS" => Ok(LocationType::Nas),
            "Unknown" => Ok(LocationType::Unknown),
            _ => Err(PaiError::InvalidValue {
                target: "artifact location type".into(),
                value: s.to_string(),
            }),
        }
    }
}

impl TryFrom<String> for LocationType {
    type Error = PaiError;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<LocationType> for &'static str {
    fn from(t: LocationType) -> Self {
        t.as_str()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArtifactMetadata {
    pub data_type: DataType,
    pub location_type: LocationType,
}

impl ArtifactMetadata {
    pub fn new(data_type: DataType, location_type: LocationType) -> Self {
        Self {
            data_type,
            location_type,
        }
    }

    /// `{"type": {"<DataType>": {"locationType": "<LocationType>"}}}`
    pub fn to_dict(&self) -> Value {
        json!({
            "type": {
                self.data_type.as_str(): {"locationType": self.location_type.as_str()}
            }
        })
    }

    pub fn from_dict(value: &Value) -> Result<Self> {
        let malformed = || PaiError::SpecValidation(format!("Malformed artifact metadata: {value}"));
        let types = value.get("type").and_then(Value::as_object).ok_or_else(malformed)?;
        let (data_type, detail) = types.iter().next().ok_or_else(malformed)?;
        let location_type = match detail.get("locationType").and_then(Value::as_str) {
            Some(lt) => lt.parse()?,
            None => LocationType::Unknown,
        };
        Ok(Self {
            data_type: data_type.parse()?,
            location_type,
        })
    }
}

impl Default for ArtifactMetadata {
    fn default() -> Self {
        Self::new(DataType::Any, LocationType::Unknown)
    }
}

/// A variable whose value is a storage location.
#[derive(Debug, Clone, PartialEq)]
pub struct Artifact {
    core: VariableCore,
    metadata: ArtifactMetadata,
}

impl Artifact {
    pub fn new(name: impl Into<String>, metadata: ArtifactMetadata) -> Self {
        Self {
            core: VariableCore::new(name),
            metadata,
        }
    }

    pub fn dataset(name: impl Into<String>, location_type: LocationType) -> Self {
        Self::new(name, ArtifactMetadata::new(DataType::DataSet, location_type))
    }

    pub fn model(name: impl Into<String>, location_type: LocationType) -> Self {
        Self::new(name, ArtifactMetadata::new(DataType::Model, location_type))
    }

    pub fn output(mut self) -> Self {
        self.core.kind = VariableKind::Output;
        self
    }

    pub fn with_value(mut self, value: impl Into<Value>) -> Self {
        self.core.binding = Some(crate::variable::Binding::Literal(value.into()));
        self
    }

    pub fn required(mut self, required: bool) -> Self {
        self.core.required = required;
        self
    }

    pub fn with_desc(mut self, desc: impl Into<String>) -> Self {
        self.core.desc = Some(desc.into());
        self
    }

    pub fn metadata(&self) -> &ArtifactMetadata {
        &self.metadata
    }

    pub fn from_dict(kind: VariableKind, entry: &Value) -> Result<Self> {
        let name = entry
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| PaiError::SpecValidation(format!("artifact entry without a name: {entry}")))?;
        let metadata = match entry.get("metadata") {
            Some(m) if !m.is_null() => ArtifactMetadata::from_dict(m)?,
            _ => ArtifactMetadata::default(),
        };
        let mut core = VariableCore::new(name);
        core.kind = kind;
        core.required = entry.get("required").and_then(Value::as_bool).unwrap_or(false);
        core.desc = entry.get("desc").and_then(Value::as_str).map(String::from);
        core.binding = read_binding(entry)?;
        Ok(Self { core, metadata })
    }
}

impl PipelineVariable for Artifact {
    fn core(&self) -> &VariableCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut VariableCore {
        &mut self.core
    }

    fn category(&self) -> VariableCategory {
        VariableCategory::Artifacts
    }

    fn typ(&self) -> Option<String> {
        match self.metadata.data_type {
            DataType::Any => None,
            other => Some(other.as_str().to_string()),
        }
    }

    /// A URI string or a location descriptor object.
    fn validate_value(&self, value: &Value) -> bool {
        value.is_string() || value.is_object()
    }

    fn to_dict(&self) -> Result<Value> {
        let mut d = Map::new();
        d.insert("name".into(), Value::String(self.core.name.clone()));
        if let Some(ref desc) = self.core.desc {
            d.insert("desc".into(), Value::String(desc.clone()));
        }
        d.insert("metadata".into(), self.metadata.to_dict());
        d.insert("required".into(), Value::Bool(self.core.required));
        insert_binding(&self.core, &mut d)?;
        Ok(Value::Object(d))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::variable::{Argument, Scope, VariableRef};

    #[test]
    fn metadata_dict_shape() {
        let m = ArtifactMetadata::new(DataType::DataSet, LocationType::MaxComputeTable);
        assert_eq!(
            m.to_dict(),
            json!({"type": {"DataSet": {"locationType": "MaxComputeTable"}}})
        );
        assert_eq!(ArtifactMetadata::from_dict(&m.to_dict()).unwrap(), m);
    }

    #[test]
    fn metadata_without_location_is_unknown() {
        let m = ArtifactMetadata::from_dict(&json!({"type": {"Model": {}}})).unwrap();
        assert_eq!(m.location_type, LocationType::Unknown);
        assert!(ArtifactMetadata::from_dict(&json!({"type": {}})).is_err());
    }

    #[test]
    fn required_always_present() {
        let a = Artifact::dataset("train_data", LocationType::Oss);
        let d = a.to_dict().unwrap();
        assert_eq!(d["required"], json!(false));
        assert_eq!(d["metadata"]["type"]["DataSet"]["locationType"], json!("OSS"));
    }

    #[test]
    fn literal_must_be_uri_or_descriptor() {
        let mut a = Artifact::dataset("input", LocationType::Oss);
        a.assign(Argument::from("oss://bucket/path/")).unwrap();
        a.assign(Argument::from(serde_json::json!({"location": {"table": "t"}})))
            .unwrap();
        assert!(a.assign(Argument::from(7i64)).is_err());
    }

    #[test]
    fn model_cannot_bind_to_dataset_producer() {
        let producer = Artifact::dataset("out", LocationType::Oss).output();
        let mut producer_ref = producer.to_ref();
        producer_ref.scope = Some(Scope::Step("prep".into()));

        let mut model_input = Artifact::model("model", LocationType::Oss);
        let err = model_input.assign(Argument::from(&producer_ref)).unwrap_err();
        assert!(matches!(err, PaiError::TypeMismatch { .. }));

        let mut any_input = Artifact::new("anything", ArtifactMetadata::default());
        any_input.assign(Argument::from(&producer_ref)).unwrap();
    }

    #[test]
    fn from_dict_round_trip_with_reference() {
        let mut a = Artifact::model("m", LocationType::Oss).required(true);
        let source = VariableRef::parse("{{pipelines.train.outputs.artifacts.model}}").unwrap();
        a.assign(Argument::from(source)).unwrap();

        let d = a.to_dict().unwrap();
        assert_eq!(d["from"], json!("{{pipelines.train.outputs.artifacts.model}}"));
        let restored = Artifact::from_dict(VariableKind::Input, &d).unwrap();
        assert_eq!(restored, a);
    }
}

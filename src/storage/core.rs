use anyhow::{bail, Result};

/// A single stored entry.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    U64(Vec<u64>),
    F64(Vec<f64>),
    ScalarU64(u64),
    ScalarF64(f64),
    String(String),
}

impl From<Vec<u64>> for Value {
    fn from(value: Vec<u64>) -> Self {
        Value::U64(value)
    }
}
impl From<Vec<f64>> for Value {
    fn from(value: Vec<f64>) -> Self {
        Value::F64(value)
    }
}
impl From<u64> for Value {
    fn from(value: u64) -> Self {
        Value::ScalarU64(value)
    }
}
impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::ScalarF64(value)
    }
}
impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_string())
    }
}

impl Value {
    fn kind(&self) -> &'static str {
        match self {
            Value::U64(_) => "u64 array",
            Value::F64(_) => "f64 array",
            Value::ScalarU64(_) => "u64 scalar",
            Value::ScalarF64(_) => "f64 scalar",
            Value::String(_) => "string",
        }
    }

    pub fn as_f64s(&self) -> Result<&[f64]> {
        match self {
            Value::F64(v) => Ok(v.as_slice()),
            other => bail!("Expected f64 array, found {}", other.kind()),
        }
    }

    pub fn as_u64s(&self) -> Result<&[u64]> {
        match self {
            Value::U64(v) => Ok(v.as_slice()),
            other => bail!("Expected u64 array, found {}", other.kind()),
        }
    }

    pub fn as_scalar_f64(&self) -> Result<f64> {
        match self {
            Value::ScalarF64(v) => Ok(*v),
            other => bail!("Expected f64 scalar, found {}", other.kind()),
        }
    }

    pub fn as_scalar_u64(&self) -> Result<u64> {
        match self {
            Value::ScalarU64(v) => Ok(*v),
            other => bail!("Expected u64 scalar, found {}", other.kind()),
        }
    }

    pub fn as_str(&self) -> Result<&str> {
        match self {
            Value::String(v) => Ok(v.as_str()),
            other => bail!("Expected string, found {}", other.kind()),
        }
    }
}

/// A hierarchical container of named values.
///
/// Mirrors the group/dataset layout of HDF5 and zarr stores so that a file
/// backend only has to implement these four methods.
pub trait Group: Sized {
    /// Create the child group `name`, replacing an existing one.
    fn create_group(&mut self, name: &str) -> Result<&mut Self>;

    /// Look up an existing child group.
    fn group(&self, name: &str) -> Result<&Self>;

    /// Store `value` under `key`, replacing an existing entry.
    fn write(&mut self, key: &str, value: Value) -> Result<()>;

    fn read(&self, key: &str) -> Result<&Value>;

    /// Whether a value or group is stored under `key`.
    fn contains(&self, key: &str) -> bool;
}

/// Types that write themselves into a named child group and read back
/// from it.
pub trait Persist: Sized {
    fn write_to<G: Group>(&self, parent: &mut G, name: &str) -> Result<()>;

    fn read_from<G: Group>(parent: &G, name: &str) -> Result<Self>;
}

//! Built-in functions.
//!
//! | URN | Output |
//! |-----|--------|
//! | `urn:forrst:forrst:fn:ping` | typed health result |
//! | `urn:forrst:forrst:fn:describe` | raw listing of registered functions |
//! | `urn:forrst:forrst:fn:echo` | typed copy of the call arguments |

use async_trait::async_trait;
use protocol::{ForrstError, Function, FunctionOutput, RequestObject, Timestamp};
use serde_json::{json, Value};

use crate::registry::{FunctionDescriptor, RegistryError};

pub const PING_URN: &str = "urn:forrst:forrst:fn:ping";
pub const DESCRIBE_URN: &str = "urn:forrst:forrst:fn:describe";
pub const ECHO_URN: &str = "urn:forrst:forrst:fn:echo";

const SYSTEM_VERSION: &str = "1.0.0";

pub fn ping_descriptor() -> Result<FunctionDescriptor, RegistryError> {
    Ok(FunctionDescriptor::new(PING_URN, SYSTEM_VERSION)?.with_summary("Health check"))
}

pub fn describe_descriptor() -> Result<FunctionDescriptor, RegistryError> {
    Ok(FunctionDescriptor::new(DESCRIBE_URN, SYSTEM_VERSION)?
        .with_summary("Lists every registered function"))
}

pub fn echo_descriptor() -> Result<FunctionDescriptor, RegistryError> {
    Ok(FunctionDescriptor::new(ECHO_URN, SYSTEM_VERSION)?.with_summary("Returns its arguments"))
}

/// Reports the engine as healthy.
#[derive(Debug, Clone, Copy, Default)]
pub struct Ping;

#[async_trait]
impl Function for Ping {
    async fn call(&self, _request: &RequestObject) -> Result<FunctionOutput, ForrstError> {
        Ok(FunctionOutput::Result(json!({
            "status": "healthy",
            "timestamp": Timestamp::now(),
        })))
    }
}

/// Lists the functions registered at build time.
#[derive(Debug, Clone)]
pub struct Describe {
    listing: Value,
}

impl Describe {
    pub fn new(descriptors: Vec<FunctionDescriptor>) -> Self {
        Self {
            listing: json!({ "functions": descriptors }),
        }
    }
}

#[async_trait]
impl Function for Describe {
    async fn call(&self, _request: &RequestObject) -> Result<FunctionOutput, ForrstError> {
        Ok(FunctionOutput::Raw(self.listing.clone()))
    }
}

/// Returns the call arguments unchanged (`{}` when there are none).
#[derive(Debug, Clone, Copy, Default)]
pub struct Echo;

#[async_trait]
impl Function for Echo {
    async fn call(&self, request: &RequestObject) -> Result<FunctionOutput, ForrstError> {
        let arguments = request.call.arguments.clone().unwrap_or_default();
        Ok(FunctionOutput::Result(Value::Object(arguments)))
    }
}

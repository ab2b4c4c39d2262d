use serde::Deserialize;
use serde_json::{Map, Value};

#[derive(Debug, Deserialize)]
pub struct CreateUserRequest {
    pub line_user_id: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub preferences: Option<Map<String, Value>>,
}

/// Absent fields are left as stored; `preferences` is merged key by key.
#[derive(Debug, Deserialize)]
pub struct UpdateUserRequest {
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub preferences: Option<Map<String, Value>>,
}

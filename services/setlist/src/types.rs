use std::fmt;

use serde::{Deserialize, Serialize};

use crate::errors::SetListError;

// Server-assigned id of a set document
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SetId(pub String);


#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TrackId(pub String);


// Session-scoped identity of whoever runs this client
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UserId(pub String);

impl UserId {
    pub fn generate() -> Self {
        UserId(format!("user_{}", uuid::Uuid::new_v4().simple()))
    }
}

macro_rules! display_id {
    ($($t:ty),*) => {
        $(
            impl fmt::Display for $t {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    f.write_str(&self.0)
                }
            }

            impl $t {
                pub fn as_str(&self) -> &str { &self.0 }
            }
        )*
    };
}

display_id!(SetId, TrackId, UserId);


#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub latitude: f64,
    pub longitude: f64
}

impl Coordinates {
    pub fn new(latitude: f64, longitude: f64) -> Result<Self, SetListError> {
        if !(-90.0..=90.0).contains(&latitude) {
            return Err(SetListError::Config(
                format!("latitude out of range: {latitude}")
            ));
        }
        if !(-180.0..=180.0).contains(&longitude) {
            return Err(SetListError::Config(
                format!("longitude out of range: {longitude}")
            ));
        }
        Ok( Self { latitude, longitude } )
    }
}


#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Vote {
    Like,
    Dislike
}

impl Vote {
    pub fn as_str(self) -> &'static str {
        match self {
            Vote::Like => "like",
            Vote::Dislike => "dislike"
        }
    }
    pub fn parse(s: &str) -> Option<Vote> {
        match s {
            "like" => Some(Vote::Like),
            "dislike" => Some(Vote::Dislike),
            _ => None
        }
    }
}

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
pub enum Label {
    Normal,
    Pneumonia,
}

impl Label {
    /// Strict threshold: a probability of exactly 0.5 is Normal.
    pub fn from_probability(probability: f32) -> Self {
        if probability > 0.5 {
            Label::Pneumonia
        } else {
            Label::Normal
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct PredictionResponse {
    pub label: Label,
    /// Percent, one decimal.
    pub confidence: f32,
    pub overlay_url: Option<String>,
    /// Percent, one decimal.
    pub intensity_score: f32,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ErrorResponse {
    pub error: String,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RegisterRequest {
    pub username: String,
    pub email: String,
    pub password: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct UserProfile {
    pub id: Uuid,
    pub username: String,
    pub email: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct LoginResponse {
    pub token: String,
    pub user: UserProfile,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct DashboardResponse {
    pub username: String,
    pub quote: String,
}

/// Rounds a unit-interval value to a percentage with one decimal.
pub fn to_percent(value: f32) -> f32 {
    (value * 1000.0).round() / 10.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn half_probability_is_normal() {
        assert_eq!(Label::from_probability(0.5), Label::Normal);
        assert_eq!(Label::from_probability(0.5001), Label::Pneumonia);
        assert_eq!(Label::from_probability(0.0), Label::Normal);
    }

    #[test]
    fn label_display_matches_wire_name() {
        assert_eq!(Label::Pneumonia.to_string(), "Pneumonia");
        assert_eq!(Label::from_str("Normal").unwrap(), Label::Normal);
        assert_eq!(serde_json::to_string(&Label::Normal).unwrap(), "\"Normal\"");
    }

    #[test]
    fn percent_keeps_one_decimal() {
        assert_eq!(to_percent(0.8), 80.0);
        assert_eq!(to_percent(0.93), 93.0);
        assert_eq!(to_percent(0.12345), 12.3);
    }

    #[test]
    fn null_overlay_serializes_as_null() {
        let response = PredictionResponse {
            label: Label::Normal,
            confidence: 80.0,
            overlay_url: None,
            intensity_score: 0.0,
        };
        let json = serde_json::to_value(&response).unwrap();
        assert!(json["overlay_url"].is_null());
        assert_eq!(json["label"], "Normal");
    }
}

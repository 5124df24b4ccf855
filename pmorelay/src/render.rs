//! Embed-like display payloads describing what a session plays

use crate::sink::SinkLocation;
use crate::station::StationInfo;
use pmostream::Track;
use serde::{Deserialize, Serialize};

/// Field name used when there is nothing to show
const BLANK: &str = " ";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisplayField {
    pub name: String,
    pub value: String,
    pub inline: bool,
}

/// Plain data handed to a [`RenderSurface`](crate::RenderSurface).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisplayPayload {
    /// RGB accent color
    pub color: u32,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thumbnail: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<DisplayField>,
}

impl DisplayPayload {
    /// Station view shown while no track is known yet.
    pub fn idle(station: &StationInfo, location: &SinkLocation) -> Self {
        Self {
            color: station.color,
            title: station.name.clone(),
            url: Some(station.url.clone()),
            description: Some(location.playing_in()),
            thumbnail: Some(station.icon.clone()),
            fields: Vec::new(),
        }
    }

    pub fn track(station: &StationInfo, track: &Track, location: &SinkLocation) -> Self {
        let mut description = format!("### {}", track.title);
        for source in &track.source_labels {
            description.push_str(&format!(" [{}]", source));
        }

        let duration = track
            .formatted_duration()
            .map(|d| format!("Duration: `{}`", d))
            .unwrap_or_else(|| BLANK.to_string());

        Self {
            color: station.color,
            title: track.artists_display(),
            url: track.detail_url.clone(),
            description: Some(description),
            thumbnail: track.cover_art_url.clone(),
            fields: vec![
                DisplayField {
                    name: duration,
                    value: location.playing_in(),
                    inline: false,
                },
                DisplayField {
                    name: BLANK.to_string(),
                    value: format!("**[{}]({})**", station.name, station.url),
                    inline: false,
                },
            ],
        }
    }

    /// Shown when the station could not be reached.
    pub fn failure(station: &StationInfo, reason: &str) -> Self {
        Self {
            color: station.color,
            title: station.name.clone(),
            url: Some(station.url.clone()),
            description: Some(format!("Could not connect to {}: {}", station.name, reason)),
            thumbnail: Some(station.icon.clone()),
            fields: Vec::new(),
        }
    }
}

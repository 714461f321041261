//! HLS playlist text synthesis.

use serde::{Deserialize, Serialize};

/// Video rendition parameters. Bitrate is in kbit/s.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoProfile {
    pub width: u32,
    pub height: u32,
    pub bitrate: u32,
}

/// Audio rendition parameters. Bitrate is in kbit/s.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioProfile {
    pub bitrate: u32,
}

/// Render a VOD variant playlist for the given breakpoints.
///
/// Segment `i` spans `breakpoints[i]..breakpoints[i+1]`; `segment_name`
/// maps the index to the URI emitted for it.
pub fn variant_playlist(
    breakpoints: &[f64],
    target_duration: f64,
    mut segment_name: impl FnMut(usize) -> String,
) -> String {
    let mut lines = vec![
        "#EXTM3U".to_string(),
        "#EXT-X-VERSION:4".to_string(),
        "#EXT-X-PLAYLIST-TYPE:VOD".to_string(),
        "#EXT-X-MEDIA-SEQUENCE:0".to_string(),
        format!("#EXT-X-TARGETDURATION:{target_duration:.2}"),
    ];

    for i in 1..breakpoints.len() {
        lines.push(format!(
            "#EXTINF:{:.3}, no desc",
            breakpoints[i] - breakpoints[i - 1]
        ));
        lines.push(segment_name(i - 1));
    }

    lines.push("#EXT-X-ENDLIST".to_string());
    lines.join("\n")
}

/// Render a master playlist enumerating the given profiles, sorted by
/// bandwidth ascending.
///
/// `bandwidth` entries are in bits per second; `variant_name` maps a profile
/// name to the variant playlist URI.
pub fn master_playlist(
    profiles: &[(String, VideoProfile, u64)],
    mut variant_name: impl FnMut(&str) -> String,
) -> String {
    let mut layers: Vec<_> = profiles.iter().collect();
    layers.sort_by_key(|(_, _, bandwidth)| *bandwidth);

    let mut lines = vec!["#EXTM3U".to_string()];
    for (name, profile, bandwidth) in layers {
        lines.push(format!(
            "#EXT-X-STREAM-INF:BANDWIDTH={},RESOLUTION={}x{},NAME={}",
            bandwidth, profile.width, profile.height, name
        ));
        lines.push(variant_name(name));
    }

    lines.join("\n") + "\n"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn variant_playlist_lists_every_segment() {
        let breakpoints = [0.0, 3.5, 7.0, 9.5];
        let playlist = variant_playlist(&breakpoints, 4.75, |i| format!("720p-{i:05}.ts"));

        assert!(playlist.starts_with("#EXTM3U"));
        assert!(playlist.contains("#EXT-X-TARGETDURATION:4.75"));
        assert!(playlist.contains("#EXTINF:3.500, no desc\n720p-00000.ts"));
        assert!(playlist.contains("#EXTINF:2.500, no desc\n720p-00002.ts"));
        assert!(playlist.ends_with("#EXT-X-ENDLIST"));

        // must parse as a media playlist with one entry per segment
        let (_, parsed) = m3u8_rs::parse_media_playlist(playlist.as_bytes()).unwrap();
        assert_eq!(parsed.segments.len(), 3);
        assert!(parsed.end_list);
    }

    #[test]
    fn master_playlist_sorts_by_bandwidth() {
        let profiles = vec![
            (
                "1080p".to_string(),
                VideoProfile {
                    width: 1920,
                    height: 1080,
                    bitrate: 4500,
                },
                4_852_000,
            ),
            (
                "360p".to_string(),
                VideoProfile {
                    width: 640,
                    height: 360,
                    bitrate: 800,
                },
                967_000,
            ),
        ];
        let playlist = master_playlist(&profiles, |name| format!("{name}.m3u8"));

        let low = playlist.find("360p.m3u8").unwrap();
        let high = playlist.find("1080p.m3u8").unwrap();
        assert!(low < high, "lower bandwidth variant must come first");

        let (_, parsed) = m3u8_rs::parse_master_playlist(playlist.as_bytes()).unwrap();
        assert_eq!(parsed.variants.len(), 2);
        assert_eq!(parsed.variants[0].bandwidth, 967_000);
    }
}

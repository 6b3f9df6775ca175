//! Catch-up URL construction.

use chrono::Local;
use tvplay_proto::protocol::EpgProgramme;

use crate::collaborators::TimeShiftTransformer;

const SEEK_TIME_FORMAT: &str = "%Y%m%d%H%M%S";

/// `<param>=<start>-<end>` with both instants in local time.
pub fn seek_query(param: &str, programme: &EpgProgramme) -> String {
    format!(
        "{}={}-{}",
        param,
        programme.start_at.with_timezone(&Local).format(SEEK_TIME_FORMAT),
        programme.end_at.with_timezone(&Local).format(SEEK_TIME_FORMAT),
    )
}

pub fn append_query(url: &str, query: &str) -> String {
    let sep = if url.contains('?') { '&' } else { '?' };
    format!("{}{}{}", url, sep, query)
}

/// The URL handed to the player: unchanged for live playback, otherwise the
/// seek window is appended and the result passed through `transformer`.
pub fn playback_url(
    url: &str,
    programme: Option<&EpgProgramme>,
    param: &str,
    transformer: &dyn TimeShiftTransformer,
) -> String {
    match programme {
        None => url.to_string(),
        Some(p) => transformer.to_seekable_url(&append_query(url, &seek_query(param, p))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn programme() -> EpgProgramme {
        EpgProgramme {
            title: "Morning News".to_string(),
            start_at: Local
                .with_ymd_and_hms(2024, 1, 1, 10, 0, 0)
                .unwrap()
                .with_timezone(&Utc),
            end_at: Local
                .with_ymd_and_hms(2024, 1, 1, 10, 30, 0)
                .unwrap()
                .with_timezone(&Utc),
        }
    }

    struct Suffix;

    impl TimeShiftTransformer for Suffix {
        fn to_seekable_url(&self, url: &str) -> String {
            format!("{}#ts", url)
        }
    }

    #[test]
    fn test_seek_query_uses_local_time() {
        assert_eq!(
            seek_query("playseek", &programme()),
            "playseek=20240101100000-20240101103000"
        );
    }

    #[test]
    fn test_append_starts_or_extends_query() {
        assert_eq!(
            append_query("http://h/s.m3u8", "playseek=1-2"),
            "http://h/s.m3u8?playseek=1-2"
        );
        assert_eq!(
            append_query("http://h/s.m3u8?token=abc", "playseek=1-2"),
            "http://h/s.m3u8?token=abc&playseek=1-2"
        );
    }

    #[test]
    fn test_playback_url_only_rewrites_timeshift() {
        assert_eq!(
            playback_url("http://h/s.m3u8", None, "playseek", &Suffix),
            "http://h/s.m3u8"
        );
        assert_eq!(
            playback_url("http://h/s.m3u8", Some(&programme()), "playseek", &Suffix),
            "http://h/s.m3u8?playseek=20240101100000-20240101103000#ts"
        );
    }
}

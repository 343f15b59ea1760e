#![forbid(unsafe_code)]

//! Format-selection policy: which yt-dlp format selectors to try, in which
//! order, for a given site family and quality tier.
//!
//! Different hosting sites expose different codec/container combinations and
//! some playback targets only accept H.264/AAC, so a single fixed selector
//! fails far more often than an ordered-degradation chain. The chains are
//! plain data tables so they can be tested without touching the network.

/// Hosting-domain classification of the input URL. Bilibili gets its own
/// chain and Referer because it serves split audio/video streams and checks
/// the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SiteFamily {
    Generic,
    Bilibili,
}

impl SiteFamily {
    pub fn classify(url: &str) -> Self {
        let lower = url.to_ascii_lowercase();
        if lower.contains("bilibili.com") || lower.contains("bilibili.tv") {
            Self::Bilibili
        } else {
            Self::Generic
        }
    }

    pub const fn is_bilibili(self) -> bool {
        matches!(self, Self::Bilibili)
    }

    pub const fn referer(self) -> &'static str {
        match self {
            Self::Bilibili => "https://www.bilibili.com/",
            Self::Generic => "https://www.google.com/",
        }
    }
}

/// Requested quality tier. An absent quality means 720p; an unrecognized
/// string falls back to the container-preferring default selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Quality {
    Worst,
    P360,
    P480,
    P720,
    P1080,
    Default,
}

impl Quality {
    pub fn parse(value: Option<&str>) -> Self {
        match value.map(str::trim) {
            None => Self::P720,
            Some("worst") => Self::Worst,
            Some("360") => Self::P360,
            Some("480") => Self::P480,
            Some("720") => Self::P720,
            Some("1080") => Self::P1080,
            Some(_) => Self::Default,
        }
    }

    fn selector(self) -> &'static str {
        match self {
            Self::Worst => "best[ext=mp4]/worst[ext=mp4]/worst",
            Self::P360 => "best[height<=360][ext=mp4]/best[height<=360]/best",
            Self::P480 => "best[height<=480][ext=mp4]/best[height<=480]/best",
            Self::P720 => "best[height<=720][ext=mp4]/best[height<=720]/best",
            Self::P1080 => "best[height<=1080][ext=mp4]/best[height<=1080]/best",
            Self::Default => "best[ext=mp4]/best",
        }
    }
}

/// One entry of the fallback chain: a yt-dlp format selector plus a label
/// used in logs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatAttempt {
    pub selector: String,
    pub label: &'static str,
    pub from_browser_cookies: bool,
}

impl FormatAttempt {
    fn new(selector: impl Into<String>, label: &'static str, from_browser_cookies: bool) -> Self {
        Self {
            selector: selector.into(),
            label,
            from_browser_cookies,
        }
    }
}

// Bilibili chain, quality-independent: force H.264 + AAC first so the merged
// file plays in legacy players, then progressively loosen the constraint.
const BILIBILI_CHAIN: &[(&str, &str)] = &[
    (
        "bestvideo[vcodec^=avc1]+bestaudio[acodec^=mp4a]/best[ext=mp4]/best",
        "bilibili avc+aac",
    ),
    ("bestvideo+bestaudio/best", "bilibili best combined"),
    ("best", "bilibili single stream"),
    ("worst", "bilibili worst"),
];

/// Returns the ordered list of attempts for one request. The first success
/// short-circuits the rest; the caller never retries beyond this chain.
pub fn plan_attempts(family: SiteFamily, quality: Quality) -> Vec<FormatAttempt> {
    match family {
        SiteFamily::Bilibili => BILIBILI_CHAIN
            .iter()
            .map(|&(selector, label)| FormatAttempt::new(selector, label, false))
            .collect(),
        SiteFamily::Generic => {
            let base = quality.selector();
            vec![
                FormatAttempt::new(base, "primary with browser cookies", true),
                FormatAttempt::new(base, "retry without cookies", false),
                FormatAttempt::new("best", "fallback best", false),
            ]
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_matches_bilibili_domains() {
        assert_eq!(
            SiteFamily::classify("https://www.bilibili.com/video/BV1xx411c7mD"),
            SiteFamily::Bilibili
        );
        assert_eq!(
            SiteFamily::classify("https://WWW.BILIBILI.TV/en/video/123"),
            SiteFamily::Bilibili
        );
        assert_eq!(
            SiteFamily::classify("https://www.youtube.com/watch?v=abc"),
            SiteFamily::Generic
        );
    }

    #[test]
    fn quality_parse_defaults() {
        assert_eq!(Quality::parse(None), Quality::P720);
        assert_eq!(Quality::parse(Some("1080")), Quality::P1080);
        assert_eq!(Quality::parse(Some("worst")), Quality::Worst);
        assert_eq!(Quality::parse(Some("4k")), Quality::Default);
    }

    #[test]
    fn bilibili_chain_starts_constrained_then_loosens() {
        let attempts = plan_attempts(SiteFamily::Bilibili, Quality::P720);
        assert_eq!(attempts.len(), 4);
        assert_eq!(
            attempts[0].selector,
            "bestvideo[vcodec^=avc1]+bestaudio[acodec^=mp4a]/best[ext=mp4]/best"
        );
        assert_eq!(attempts[1].selector, "bestvideo+bestaudio/best");
        assert!(attempts.iter().all(|attempt| !attempt.from_browser_cookies));
        // Quality never changes the Bilibili chain.
        assert_eq!(attempts, plan_attempts(SiteFamily::Bilibili, Quality::Worst));
    }

    #[test]
    fn generic_720_caps_height_and_prefers_mp4() {
        let attempts = plan_attempts(SiteFamily::Generic, Quality::P720);
        assert_eq!(attempts.len(), 3);
        assert_eq!(
            attempts[0].selector,
            "best[height<=720][ext=mp4]/best[height<=720]/best"
        );
        assert!(attempts[0].from_browser_cookies);
        assert_eq!(attempts[1].selector, attempts[0].selector);
        assert!(!attempts[1].from_browser_cookies);
        assert_eq!(attempts[2].selector, "best");
        assert!(!attempts[2].from_browser_cookies);
    }

    #[test]
    fn generic_chain_never_contains_bilibili_selectors() {
        for quality in [
            Quality::Worst,
            Quality::P360,
            Quality::P480,
            Quality::P720,
            Quality::P1080,
            Quality::Default,
        ] {
            let attempts = plan_attempts(SiteFamily::Generic, quality);
            assert!(
                attempts
                    .iter()
                    .all(|attempt| !attempt.selector.contains("avc1"))
            );
            assert_eq!(attempts.last().map(|a| a.selector.as_str()), Some("best"));
        }
    }

    #[test]
    fn worst_quality_requests_worst_stream() {
        let attempts = plan_attempts(SiteFamily::Generic, Quality::Worst);
        assert_eq!(attempts[0].selector, "best[ext=mp4]/worst[ext=mp4]/worst");
    }
}

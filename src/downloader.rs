#![forbid(unsafe_code)]

//! Invokes the external yt-dlp engine for one format-selector attempt and
//! verifies that a usable file actually landed on disk.
//!
//! The engine is treated as a black box: we hand it a selector, headers and
//! retry settings, then trust nothing it reports until a file is confirmed
//! to exist. The engine may change the extension while merging streams, so a
//! missing expected path triggers a base-name scan of the output directory
//! before the attempt is declared failed.

use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{info, warn};

use crate::policy::{FormatAttempt, SiteFamily};

const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";
const ACCEPT: &str = "text/html,application/xhtml+xml,application/xml;q=0.9,image/avif,image/webp,image/apng,*/*;q=0.8,application/signed-exchange;v=b3;q=0.7";
const ACCEPT_LANGUAGE: &str = "en-US,en;q=0.9,th;q=0.8";
const RETRIES: &str = "10";
const RETRY_SLEEP_SECS: &str = "5";
const FALLBACK_TITLE: &str = "Video";

/// A confirmed download: the resolved title and the file inside the
/// invoker's output directory.
#[derive(Debug, Clone)]
pub struct Download {
    pub title: String,
    pub file: PathBuf,
}

/// Subset of the info dict yt-dlp prints with `--print-json`.
#[derive(Debug, Deserialize)]
struct InfoJson {
    title: Option<String>,
    ext: Option<String>,
    filename: Option<String>,
    #[serde(default)]
    requested_downloads: Vec<RequestedDownload>,
}

#[derive(Debug, Deserialize)]
struct RequestedDownload {
    filepath: Option<String>,
}

/// One-shot yt-dlp runner bound to an output directory.
///
/// `program` defaults to `yt-dlp` on PATH; tests point it at stub scripts.
#[derive(Debug, Clone)]
pub struct Downloader {
    output_dir: PathBuf,
    program: PathBuf,
}

impl Downloader {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
            program: PathBuf::from("yt-dlp"),
        }
    }

    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = program.into();
        self
    }

    /// Runs one attempt to completion, blocking the calling thread. The
    /// error value is raw engine text kept for later translation; it is
    /// never shown to the user untranslated.
    pub fn run_attempt(
        &self,
        url: &str,
        attempt: &FormatAttempt,
        family: SiteFamily,
    ) -> Result<Download, String> {
        info!(
            label = attempt.label,
            selector = %attempt.selector,
            "invoking download engine"
        );

        if let Err(err) = fs::create_dir_all(&self.output_dir) {
            return Err(format!(
                "could not create {}: {err}",
                self.output_dir.display()
            ));
        }

        let output = Command::new(&self.program)
            .args(self.build_args(url, attempt, family))
            .output()
            .map_err(|err| format!("failed to launch {}: {err}", self.program.display()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            if stderr.is_empty() {
                return Err(format!("download engine exited with {}", output.status));
            }
            return Err(stderr);
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let info: InfoJson = stdout
            .lines()
            .rev()
            .find(|line| !line.trim().is_empty())
            .and_then(|line| serde_json::from_str(line).ok())
            .ok_or_else(|| "download engine returned no usable metadata".to_string())?;

        let title = info
            .title
            .clone()
            .filter(|title| !title.is_empty())
            .unwrap_or_else(|| FALLBACK_TITLE.to_string());
        let expected = self.expected_path(&info, &title);

        let actual = if expected.exists() {
            Some(expected.clone())
        } else {
            self.scan_for_base_name(&expected)
        };

        match actual {
            Some(file) => {
                info!(file = %file.display(), "download confirmed on disk");
                Ok(Download { title, file })
            }
            None => Err(format!(
                "download completed but no file was found at {}",
                expected.display()
            )),
        }
    }

    fn build_args(&self, url: &str, attempt: &FormatAttempt, family: SiteFamily) -> Vec<String> {
        let mut args = vec![
            "--format".to_string(),
            attempt.selector.clone(),
            "--output".to_string(),
            self.output_dir
                .join("%(title)s.%(ext)s")
                .to_string_lossy()
                .into_owned(),
            "--no-playlist".to_string(),
            "--force-overwrites".to_string(),
            "--no-check-certificates".to_string(),
            "--retries".to_string(),
            RETRIES.to_string(),
            "--fragment-retries".to_string(),
            RETRIES.to_string(),
            "--retry-sleep".to_string(),
            RETRY_SLEEP_SECS.to_string(),
            "--user-agent".to_string(),
            USER_AGENT.to_string(),
            "--referer".to_string(),
            family.referer().to_string(),
            "--add-headers".to_string(),
            format!("Accept:{ACCEPT}"),
            "--add-headers".to_string(),
            format!("Accept-Language:{ACCEPT_LANGUAGE}"),
            "--extractor-args".to_string(),
            "youtube:player_client=android,web;skip=dash,hls".to_string(),
            "--extractor-args".to_string(),
            "bilibili:use_api_device=pc".to_string(),
            "--merge-output-format".to_string(),
            "mp4".to_string(),
            "--print-json".to_string(),
            "--no-warnings".to_string(),
            "--no-progress".to_string(),
        ];
        if attempt.from_browser_cookies {
            args.push("--cookies-from-browser".to_string());
            args.push("chrome".to_string());
        }
        args.push(url.to_string());
        args
    }

    /// Where the engine should have written the file, preferring the paths
    /// it reported itself over the `<title>.<ext>` naming pattern.
    fn expected_path(&self, info: &InfoJson, title: &str) -> PathBuf {
        if let Some(filepath) = info
            .requested_downloads
            .iter()
            .find_map(|download| download.filepath.as_deref())
        {
            return PathBuf::from(filepath);
        }
        if let Some(filename) = info.filename.as_deref() {
            return PathBuf::from(filename);
        }
        let ext = info.ext.as_deref().unwrap_or("mp4");
        self.output_dir.join(format!("{title}.{ext}"))
    }

    /// Case-sensitive prefix scan for a file sharing the expected base name
    /// under a different extension.
    fn scan_for_base_name(&self, expected: &Path) -> Option<PathBuf> {
        let stem = expected.file_stem()?.to_string_lossy().into_owned();
        let entries = fs::read_dir(&self.output_dir).ok()?;
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with(&stem) && entry.path().is_file() {
                warn!(
                    expected = %expected.display(),
                    actual = %name,
                    "expected file missing, picked up by base-name scan"
                );
                return Some(entry.path());
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{Quality, plan_attempts};
    use tempfile::tempdir;

    fn attempt(selector: &str, cookies: bool) -> FormatAttempt {
        FormatAttempt {
            selector: selector.to_string(),
            label: "test attempt",
            from_browser_cookies: cookies,
        }
    }

    #[test]
    fn args_carry_selector_headers_and_merge_directive() {
        let downloader = Downloader::new("/tmp/out");
        let args = downloader.build_args(
            "https://example.com/v",
            &attempt("best[height<=720]", false),
            SiteFamily::Generic,
        );
        let joined = args.join("\u{1}");
        assert!(args.contains(&"best[height<=720]".to_string()));
        assert!(joined.contains("--no-playlist"));
        assert!(joined.contains("--merge-output-format\u{1}mp4"));
        assert!(joined.contains("--referer\u{1}https://www.google.com/"));
        assert!(joined.contains("--retries\u{1}10"));
        assert!(joined.contains("--retry-sleep\u{1}5"));
        assert!(!joined.contains("--cookies-from-browser"));
        assert_eq!(args.last().map(String::as_str), Some("https://example.com/v"));
    }

    #[test]
    fn cookie_attempts_add_browser_cookie_source() {
        let downloader = Downloader::new("/tmp/out");
        let args = downloader.build_args(
            "https://example.com/v",
            &attempt("best", true),
            SiteFamily::Generic,
        );
        let position = args
            .iter()
            .position(|arg| arg == "--cookies-from-browser")
            .expect("cookie flag present");
        assert_eq!(args.get(position + 1).map(String::as_str), Some("chrome"));
    }

    #[test]
    fn bilibili_attempts_use_bilibili_referer() {
        let downloader = Downloader::new("/tmp/out");
        let args = downloader.build_args(
            "https://www.bilibili.com/video/BV1",
            &attempt("best", false),
            SiteFamily::Bilibili,
        );
        let position = args.iter().position(|arg| arg == "--referer").unwrap();
        assert_eq!(
            args.get(position + 1).map(String::as_str),
            Some("https://www.bilibili.com/")
        );
    }

    #[cfg(unix)]
    mod with_stub_engine {
        use super::*;
        use std::fs;
        use std::os::unix::fs::PermissionsExt;
        use std::path::Path;

        fn install_stub(dir: &Path, body: &str) -> PathBuf {
            let script_path = dir.join("yt-dlp");
            let script = format!("#!/usr/bin/env bash\nset -eu\n{body}");
            fs::write(&script_path, script).unwrap();
            let mut perms = fs::metadata(&script_path).unwrap().permissions();
            perms.set_mode(0o755);
            fs::set_permissions(&script_path, perms).unwrap();
            script_path
        }

        // Resolves the --output template directory the same way the real
        // engine would, then drops a file there.
        const PARSE_OUTPUT: &str = r#"
output=""
prev=""
for arg in "$@"; do
  if [ "$prev" = "--output" ]; then output="$arg"; fi
  prev="$arg"
done
dir="$(dirname "$output")"
mkdir -p "$dir"
"#;

        #[test]
        fn confirmed_file_yields_success() {
            let stub_dir = tempdir().unwrap();
            let out_dir = tempdir().unwrap();
            let stub = install_stub(
                stub_dir.path(),
                &format!(
                    "{PARSE_OUTPUT}printf 'bytes' > \"$dir/My Clip.mp4\"\nprintf '%s\\n' '{{\"title\":\"My Clip\",\"ext\":\"mp4\"}}'\n"
                ),
            );

            let downloader = Downloader::new(out_dir.path()).with_program(stub);
            let attempts = plan_attempts(SiteFamily::Generic, Quality::P720);
            let download = downloader
                .run_attempt("https://example.com/v", &attempts[1], SiteFamily::Generic)
                .expect("download succeeds");
            assert_eq!(download.title, "My Clip");
            assert_eq!(
                download.file.file_name().unwrap().to_string_lossy(),
                "My Clip.mp4"
            );
            assert!(download.file.exists());
        }

        #[test]
        fn changed_extension_is_found_by_base_name_scan() {
            let stub_dir = tempdir().unwrap();
            let out_dir = tempdir().unwrap();
            // Reports mp4 but writes mkv, as a merge step might.
            let stub = install_stub(
                stub_dir.path(),
                &format!(
                    "{PARSE_OUTPUT}printf 'bytes' > \"$dir/My Clip.mkv\"\nprintf '%s\\n' '{{\"title\":\"My Clip\",\"ext\":\"mp4\"}}'\n"
                ),
            );

            let downloader = Downloader::new(out_dir.path()).with_program(stub);
            let download = downloader
                .run_attempt(
                    "https://example.com/v",
                    &attempt("best", false),
                    SiteFamily::Generic,
                )
                .expect("scan picks up the mkv");
            assert_eq!(
                download.file.file_name().unwrap().to_string_lossy(),
                "My Clip.mkv"
            );
        }

        #[test]
        fn engine_failure_surfaces_stderr_text() {
            let stub_dir = tempdir().unwrap();
            let out_dir = tempdir().unwrap();
            let stub = install_stub(
                stub_dir.path(),
                "echo 'ERROR: Unsupported URL: https://example.com' >&2\nexit 1\n",
            );

            let downloader = Downloader::new(out_dir.path()).with_program(stub);
            let err = downloader
                .run_attempt(
                    "https://example.com/v",
                    &attempt("best", false),
                    SiteFamily::Generic,
                )
                .expect_err("attempt fails");
            assert!(err.contains("Unsupported URL"));
        }

        #[test]
        fn reported_success_without_file_is_failure() {
            let stub_dir = tempdir().unwrap();
            let out_dir = tempdir().unwrap();
            let stub = install_stub(
                stub_dir.path(),
                "printf '%s\\n' '{\"title\":\"Ghost\",\"ext\":\"mp4\"}'\n",
            );

            let downloader = Downloader::new(out_dir.path()).with_program(stub);
            let err = downloader
                .run_attempt(
                    "https://example.com/v",
                    &attempt("best", false),
                    SiteFamily::Generic,
                )
                .expect_err("no file means failure");
            assert!(err.contains("no file was found"));
        }

        #[test]
        fn reported_filename_is_preferred_over_title_pattern() {
            let stub_dir = tempdir().unwrap();
            let out_dir = tempdir().unwrap();
            let stub = install_stub(
                stub_dir.path(),
                &format!(
                    "{PARSE_OUTPUT}printf 'bytes' > \"$dir/actual.mp4\"\nprintf '%s\\n' \"{{\\\"title\\\":\\\"Other Title\\\",\\\"ext\\\":\\\"mp4\\\",\\\"filename\\\":\\\"$dir/actual.mp4\\\"}}\"\n"
                ),
            );

            let downloader = Downloader::new(out_dir.path()).with_program(stub);
            let download = downloader
                .run_attempt(
                    "https://example.com/v",
                    &attempt("best", false),
                    SiteFamily::Generic,
                )
                .expect("filename from engine wins");
            assert_eq!(
                download.file.file_name().unwrap().to_string_lossy(),
                "actual.mp4"
            );
            assert_eq!(download.title, "Other Title");
        }
    }
}

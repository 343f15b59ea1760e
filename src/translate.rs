#![forbid(unsafe_code)]

//! Maps raw yt-dlp error text to the short, user-facing messages shown in
//! the front end. Classification is an ordered table of substring rules
//! evaluated against the text after stripping terminal color codes, so the
//! same input always yields the same message.

use regex::Regex;
use std::sync::LazyLock;

pub const MSG_MISSING_URL: &str = "กรุณาวางลิงก์ก่อนนะคะ";
pub const MSG_UNKNOWN: &str = "Unknown error";
pub const MSG_SERVER_FAULT: &str = "เกิดข้อผิดพลาดรุนแรง";
pub const MSG_BILIBILI_SUCCESS: &str = "นุ่นโหลดวิดีโอจาก Bilibili พร้อมเสียงมาให้คุณพี่สำเร็จแล้วค่ะ! ครั้งนี้นุ่นติดตั้งระบบรวมร่างไฟล์ (FFmpeg) ให้เรียบร้อยแล้ว ดูได้แบบฟินๆ เลยนะคะ";
pub const MSG_CANNOT_OPEN_FOLDER: &str = "Cannot open folder on cloud server";

const MSG_UNSUPPORTED_URL: &str = "ขอโทษนะคะคุณพี่ ลิงก์นี้ไม่ใช่ลิงก์วิดีโอที่นุ่นรู้จักค่ะ รบกวนตรวจสอบว่าเป็นลิงก์จาก YouTube, Facebook, TikTok หรือเว็บวิดีโออื่นๆ หรือเปล่านะคะ";
const MSG_FORBIDDEN: &str = "เข้าถึงไม่ได้ (403 Forbidden) นุ่นพยายามแก้แล้วแต่ดูเหมือนเว็บนี้จะบล็อกเข้มงวดมากค่ะ คุณพี่ลองเปิดวิดีโอนี้ใน Chrome ทิ้งไว้แล้วค่อยมากดดาวน์โหลดอีกทีนะคะ";
const MSG_SIGN_IN: &str = "วิดีโอนี้ต้องเข้าสู่ระบบก่อนถึงจะดูได้ นุ่นเลยโหลดให้ไม่ได้ค่ะ";
const MSG_FFMPEG: &str = "เว็บไซต์นี้ (เช่น Bilibili) แยกไฟล์ภาพกับเสียงออกจากกันค่ะ และเนื่องจากเครื่องคุณพี่ไม่มีโปรแกรม FFmpeg นุ่นเลยรวมร่างให้ไม่ได้ค่ะ แต่นุ่นจะพยายามโหลดแบบภาพอย่างเดียวให้แทนนะคะ!";

struct Rule {
    needles: &'static [&'static str],
    case_insensitive: bool,
    message: &'static str,
}

// Evaluated top to bottom; the first matching rule wins.
const RULES: &[Rule] = &[
    Rule {
        needles: &["Unsupported URL"],
        case_insensitive: false,
        message: MSG_UNSUPPORTED_URL,
    },
    Rule {
        needles: &["403", "Forbidden"],
        case_insensitive: false,
        message: MSG_FORBIDDEN,
    },
    Rule {
        needles: &["Sign in", "login required", "confirm you're not a bot"],
        case_insensitive: false,
        message: MSG_SIGN_IN,
    },
    Rule {
        needles: &["ffmpeg"],
        case_insensitive: true,
        message: MSG_FFMPEG,
    },
];

static ANSI_ESCAPE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\x1B(?:[@-Z\\-_]|\[[0-?]*[ -/]*[@-~])").expect("ansi escape pattern")
});

/// Removes ANSI terminal control sequences such as `\x1b[0;31m`.
pub fn strip_ansi(text: &str) -> String {
    ANSI_ESCAPE.replace_all(text, "").into_owned()
}

/// Translates raw engine error text into a display message. Unclassified
/// text comes back verbatim (cleaned); empty or absent input yields the
/// generic unknown-error message.
pub fn translate(raw: Option<&str>) -> String {
    let Some(raw) = raw.map(str::trim).filter(|text| !text.is_empty()) else {
        return MSG_UNKNOWN.to_string();
    };
    let cleaned = strip_ansi(raw);
    let lowered = cleaned.to_lowercase();
    for rule in RULES {
        let hit = rule.needles.iter().any(|needle| {
            if rule.case_insensitive {
                lowered.contains(&needle.to_lowercase())
            } else {
                cleaned.contains(needle)
            }
        });
        if hit {
            return rule.message.to_string();
        }
    }
    cleaned
}

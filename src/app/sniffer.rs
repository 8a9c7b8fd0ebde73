//! Content-based format detection from a byte prefix.
//!
//! Signatures are tried most-specific-first. Every predicate checks the buffer
//! length before indexing, so any input (including an empty one) yields either
//! a classification or `None`.

/// Number of leading bytes the pipeline samples before sniffing.
pub const SAMPLE_LEN: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub mime: &'static str,
    pub extension: &'static str,
}

impl Classification {
    const fn new(mime: &'static str, extension: &'static str) -> Self {
        Self { mime, extension }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verification {
    Match,
    Mismatch { detected: String, declared: String },
}

type Predicate = fn(&[u8]) -> Option<Classification>;

const SIGNATURES: &[Predicate] = &[
    sniff_riff,
    sniff_iso_media,
    sniff_ebml,
    sniff_tar,
    sniff_fixed,
    sniff_mp3,
    sniff_text_markup,
];

const FIXED: &[(usize, &[u8], Classification)] = &[
    (0, b"\x89PNG\r\n\x1a\n", Classification::new("image/png", "png")),
    (0, b"\xFF\xD8\xFF", Classification::new("image/jpeg", "jpg")),
    (0, b"GIF87a", Classification::new("image/gif", "gif")),
    (0, b"GIF89a", Classification::new("image/gif", "gif")),
    (0, b"II*\x00", Classification::new("image/tiff", "tif")),
    (0, b"MM\x00*", Classification::new("image/tiff", "tif")),
    (0, b"\x00\x00\x01\x00", Classification::new("image/vnd.microsoft.icon", "ico")),
    (0, b"8BPS", Classification::new("image/vnd.adobe.photoshop", "psd")),
    (0, b"\xFF\x0A", Classification::new("image/jxl", "jxl")),
    (0, b"\x00\x00\x00\x0CJXL \x0D\x0A\x87\x0A", Classification::new("image/jxl", "jxl")),
    (0, b"%PDF-", Classification::new("application/pdf", "pdf")),
    (0, b"{\\rtf", Classification::new("application/rtf", "rtf")),
    (0, b"SQLite format 3\x00", Classification::new("application/vnd.sqlite3", "sqlite")),
    (0, b"\x00asm", Classification::new("application/wasm", "wasm")),
    (0, b"wOFF", Classification::new("font/woff", "woff")),
    (0, b"wOF2", Classification::new("font/woff2", "woff2")),
    (0, b"\x00\x01\x00\x00\x00", Classification::new("font/ttf", "ttf")),
    (0, b"OTTO", Classification::new("font/otf", "otf")),
    (0, b"7z\xBC\xAF\x27\x1C", Classification::new("application/x-7z-compressed", "7z")),
    (0, b"Rar!\x1A\x07", Classification::new("application/vnd.rar", "rar")),
    (0, b"\xFD7zXZ\x00", Classification::new("application/x-xz", "xz")),
    (0, b"\x28\xB5\x2F\xFD", Classification::new("application/zstd", "zst")),
    (0, b"\x1F\x8B", Classification::new("application/gzip", "gz")),
    (0, b"BZh", Classification::new("application/x-bzip2", "bz2")),
    (0, b"PK\x03\x04", Classification::new("application/zip", "zip")),
    (0, b"PK\x05\x06", Classification::new("application/zip", "zip")),
    (0, b"\xD0\xCF\x11\xE0\xA1\xB1\x1A\xE1", Classification::new("application/x-ole-storage", "msi")),
    (0, b"\x7FELF", Classification::new("application/x-elf", "elf")),
    (0, b"MZ", Classification::new("application/x-msdownload", "exe")),
    (0, b"fLaC", Classification::new("audio/flac", "flac")),
    (0, b"OggS", Classification::new("audio/ogg", "ogg")),
    (0, b"MThd", Classification::new("audio/midi", "mid")),
    (0, b"#!AMR", Classification::new("audio/amr", "amr")),
    (0, b"ID3", Classification::new("audio/mpeg", "mp3")),
    (0, b"FLV\x01", Classification::new("video/x-flv", "flv")),
    (0, b"BM", Classification::new("image/bmp", "bmp")),
];

/// Classify a byte prefix. Pure and total over every input length.
pub fn detect(bytes: &[u8]) -> Option<Classification> {
    SIGNATURES.iter().find_map(|predicate| predicate(bytes))
}

/// Compare a declared type against a sniffed one.
pub fn verify(declared: &str, detected: &str) -> Verification {
    if normalize_mime(declared) == normalize_mime(detected) {
        Verification::Match
    } else {
        Verification::Mismatch {
            detected: detected.to_string(),
            declared: declared.to_string(),
        }
    }
}

/// Lower-case, strip parameters and fold common aliases.
pub fn normalize_mime(mime: &str) -> String {
    let base = mime.split(';').next().unwrap_or(mime).trim().to_ascii_lowercase();
    match base.as_str() {
        "image/jpg" | "image/pjpeg" => "image/jpeg".to_string(),
        "image/x-png" => "image/png".to_string(),
        "image/x-icon" => "image/vnd.microsoft.icon".to_string(),
        "application/x-zip-compressed" => "application/zip".to_string(),
        "application/x-gzip" => "application/gzip".to_string(),
        "application/x-pdf" => "application/pdf".to_string(),
        "audio/x-flac" => "audio/flac".to_string(),
        "audio/mp3" => "audio/mpeg".to_string(),
        "binary/octet-stream" => "application/octet-stream".to_string(),
        "application/x-dosexec" | "application/vnd.microsoft.portable-executable" => {
            "application/x-msdownload".to_string()
        }
        _ => base,
    }
}

fn starts_at(bytes: &[u8], offset: usize, magic: &[u8]) -> bool {
    bytes
        .get(offset..offset + magic.len())
        .map_or(false, |window| window == magic)
}

fn sniff_fixed(bytes: &[u8]) -> Option<Classification> {
    FIXED
        .iter()
        .find(|(offset, magic, _)| starts_at(bytes, *offset, magic))
        .map(|(_, _, class)| *class)
}

fn sniff_riff(bytes: &[u8]) -> Option<Classification> {
    if !starts_at(bytes, 0, b"RIFF") {
        return None;
    }
    match bytes.get(8..12)? {
        b"WEBP" => Some(Classification::new("image/webp", "webp")),
        b"WAVE" => Some(Classification::new("audio/wav", "wav")),
        b"AVI " => Some(Classification::new("video/x-msvideo", "avi")),
        _ => None,
    }
}

fn sniff_iso_media(bytes: &[u8]) -> Option<Classification> {
    if !starts_at(bytes, 4, b"ftyp") {
        return None;
    }
    let brand = bytes.get(8..12)?;
    let class = match brand {
        b"heic" | b"heix" | b"hevc" | b"hevx" | b"heim" | b"heis" => {
            Classification::new("image/heic", "heic")
        }
        b"mif1" | b"msf1" => Classification::new("image/heif", "heif"),
        b"avif" | b"avis" => Classification::new("image/avif", "avif"),
        b"M4A " | b"M4B " => Classification::new("audio/mp4", "m4a"),
        b"qt  " => Classification::new("video/quicktime", "mov"),
        b"3gp4" | b"3gp5" | b"3gp6" | b"3ge6" | b"3gs7" => Classification::new("video/3gpp", "3gp"),
        b"3g2a" | b"3g2b" | b"3g2c" => Classification::new("video/3gpp2", "3g2"),
        b"crx " => Classification::new("image/x-canon-cr3", "cr3"),
        _ => Classification::new("video/mp4", "mp4"),
    };
    Some(class)
}

fn sniff_ebml(bytes: &[u8]) -> Option<Classification> {
    if !starts_at(bytes, 0, b"\x1A\x45\xDF\xA3") {
        return None;
    }
    let header = &bytes[4..bytes.len().min(64)];
    if header.windows(4).any(|window| window == b"webm") {
        Some(Classification::new("video/webm", "webm"))
    } else {
        Some(Classification::new("video/x-matroska", "mkv"))
    }
}

fn sniff_tar(bytes: &[u8]) -> Option<Classification> {
    // "ustar" sits at 257; a header shorter than 262 bytes cannot carry it.
    if bytes.len() < 262 {
        return None;
    }
    if starts_at(bytes, 257, b"ustar") {
        Some(Classification::new("application/x-tar", "tar"))
    } else {
        None
    }
}

fn sniff_mp3(bytes: &[u8]) -> Option<Classification> {
    match bytes {
        [0xFF, second, ..] if second & 0xE0 == 0xE0 && second & 0x06 != 0 => {
            Some(Classification::new("audio/mpeg", "mp3"))
        }
        _ => None,
    }
}

fn sniff_text_markup(bytes: &[u8]) -> Option<Classification> {
    let text = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
    let start = text.iter().position(|byte| !byte.is_ascii_whitespace())?;
    let text = &text[start..];
    let lower: Vec<u8> = text.iter().take(256).map(u8::to_ascii_lowercase).collect();

    if lower.starts_with(b"<svg") || (lower.starts_with(b"<?xml") && contains(&lower, b"<svg")) {
        return Some(Classification::new("image/svg+xml", "svg"));
    }
    if lower.starts_with(b"<!doctype html") || lower.starts_with(b"<html") {
        return Some(Classification::new("text/html", "html"));
    }
    if lower.starts_with(b"<?xml") {
        return Some(Classification::new("application/xml", "xml"));
    }
    None
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detect_is_total_on_short_inputs() {
        assert_eq!(detect(&[]), None);
        for len in 0..600 {
            let zeros = vec![0u8; len];
            let _ = detect(&zeros);
            let ones = vec![0xFFu8; len];
            let _ = detect(&ones);
        }
        assert_eq!(detect(b"R"), None);
        assert_eq!(detect(b"RIFF"), None);
        assert_eq!(detect(b"\x00\x00\x00\x18ftyp"), None);
    }

    #[test]
    fn detects_common_images() {
        assert_eq!(detect(b"\x89PNG\r\n\x1a\n\0\0\0\rIHDR").unwrap().mime, "image/png");
        assert_eq!(detect(b"\xFF\xD8\xFF\xE0\0\x10JFIF").unwrap().mime, "image/jpeg");
        assert_eq!(detect(b"GIF89a\x01\x00").unwrap().mime, "image/gif");
        assert_eq!(detect(b"RIFF\x24\0\0\0WEBPVP8 ").unwrap().mime, "image/webp");
        assert_eq!(detect(b"RIFF\x24\0\0\0WAVEfmt ").unwrap().mime, "audio/wav");
    }

    #[test]
    fn ftyp_brand_selects_subtype() {
        let heic = b"\x00\x00\x00\x18ftypheic\x00\x00\x00\x00mif1heic";
        assert_eq!(detect(heic).unwrap().mime, "image/heic");

        let avif = b"\x00\x00\x00\x1cftypavif\x00\x00\x00\x00";
        assert_eq!(detect(avif).unwrap().mime, "image/avif");

        let unknown = b"\x00\x00\x00\x18ftypzzzz\x00\x00\x00\x00";
        assert_eq!(detect(unknown).unwrap().mime, "video/mp4");
    }

    #[test]
    fn tar_detected_by_offset_marker() {
        let mut header = vec![0u8; 512];
        header[..8].copy_from_slice(b"file.txt");
        header[257..262].copy_from_slice(b"ustar");
        assert_eq!(detect(&header).unwrap().mime, "application/x-tar");

        // Marker cut off by a short buffer.
        assert_eq!(detect(&header[..261]), None);
    }

    #[test]
    fn windows_executable_is_flagged() {
        let exe = b"MZ\x90\x00\x03\x00\x00\x00";
        assert_eq!(detect(exe).unwrap().mime, "application/x-msdownload");
    }

    #[test]
    fn webm_vs_matroska() {
        let webm = b"\x1A\x45\xDF\xA3\x9F\x42\x86\x81\x01\x42\x82\x84webm";
        assert_eq!(detect(webm).unwrap().mime, "video/webm");
        let mkv = b"\x1A\x45\xDF\xA3\x9F\x42\x86\x81\x01\x42\x82\x88matroska";
        assert_eq!(detect(mkv).unwrap().mime, "video/x-matroska");
    }

    #[test]
    fn svg_with_leading_whitespace() {
        let svg = b"  \n<?xml version=\"1.0\"?>\n<svg xmlns=\"http://www.w3.org/2000/svg\"/>";
        assert_eq!(detect(svg).unwrap().mime, "image/svg+xml");
    }

    #[test]
    fn verify_folds_aliases() {
        assert_eq!(verify("image/jpg", "image/jpeg"), Verification::Match);
        assert_eq!(verify("IMAGE/PNG; charset=binary", "image/png"), Verification::Match);
        assert_eq!(
            verify("image/png", "application/x-msdownload"),
            Verification::Mismatch {
                detected: "application/x-msdownload".into(),
                declared: "image/png".into(),
            }
        );
    }

    #[test]
    fn generic_binary_types_share_one_name() {
        assert_eq!(normalize_mime("binary/octet-stream"), "application/octet-stream");
        assert_eq!(normalize_mime("Binary/Octet-Stream; x=1"), "application/octet-stream");
    }
}

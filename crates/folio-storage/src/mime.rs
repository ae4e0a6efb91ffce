/// Guesses a MIME type for a payload from its id.
///
/// Payload ids usually carry a file name, so the default implementation
/// only looks at the extension.
pub trait ContentTypeSniffer: Send + Sync {
    fn sniff(&self, pid: &str) -> String;
}

/// Fallback for ids with no recognised extension.
pub const OCTET_STREAM: &str = "application/octet-stream";

/// Extension-table sniffer.
#[derive(Clone, Debug, Default)]
pub struct ExtensionSniffer;

const TABLE: &[(&str, &str)] = &[
    ("json", "application/json"),
    ("tfpackage", "application/json"),
    ("xml", "application/xml"),
    ("rdf", "application/rdf+xml"),
    ("txt", "text/plain"),
    ("csv", "text/csv"),
    ("htm", "text/html"),
    ("html", "text/html"),
    ("md", "text/markdown"),
    ("pdf", "application/pdf"),
    ("zip", "application/zip"),
    ("gz", "application/gzip"),
    ("tar", "application/x-tar"),
    ("png", "image/png"),
    ("jpg", "image/jpeg"),
    ("jpeg", "image/jpeg"),
    ("gif", "image/gif"),
    ("svg", "image/svg+xml"),
    ("tif", "image/tiff"),
    ("tiff", "image/tiff"),
    ("mp3", "audio/mpeg"),
    ("wav", "audio/wav"),
    ("mp4", "video/mp4"),
    ("doc", "application/msword"),
    ("docx", "application/vnd.openxmlformats-officedocument.wordprocessingml.document"),
    ("xls", "application/vnd.ms-excel"),
    ("xlsx", "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet"),
];

impl ContentTypeSniffer for ExtensionSniffer {
    fn sniff(&self, pid: &str) -> String {
        let name = pid.rsplit('/').next().unwrap_or(pid);
        let Some((stem, ext)) = name.rsplit_once('.') else {
            return OCTET_STREAM.to_string();
        };
        if stem.is_empty() {
            return OCTET_STREAM.to_string();
        }
        let ext = ext.to_ascii_lowercase();
        TABLE
            .iter()
            .find(|(known, _)| *known == ext)
            .map_or(OCTET_STREAM, |&(_, mime)| mime)
            .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_extensions() {
        let s = ExtensionSniffer;
        assert_eq!(s.sniff("metadata.tfpackage"), "application/json");
        assert_eq!(s.sniff("scan.PNG"), "image/png");
        assert_eq!(s.sniff("dir/report.pdf"), "application/pdf");
    }

    #[test]
    fn unknown_or_missing_extension() {
        let s = ExtensionSniffer;
        assert_eq!(s.sniff("TF-OBJ-META"), OCTET_STREAM);
        assert_eq!(s.sniff("blob.xyz"), OCTET_STREAM);
        assert_eq!(s.sniff(".hidden"), OCTET_STREAM);
    }
}

//! Signature-based file type detection.
//!
//! Only leading bytes are trusted. File names, extensions and any
//! `Content-Type` sent by the remote server are ignored.

use std::path::Path;

use image::ImageFormat;
use tokio::io::AsyncReadExt;
use tracing::debug;

/// Enough bytes for every signature we recognise.
const HEADER_LEN: usize = 16;

/// A verified document format from the supported set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileFormat {
    Pdf,
    Jpeg,
    Png,
    Webp,
}

impl FileFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Pdf => "pdf",
            Self::Jpeg => "jpg",
            Self::Png => "png",
            Self::Webp => "webp",
        }
    }

    pub fn mime_type(&self) -> &'static str {
        match self {
            Self::Pdf => "application/pdf",
            Self::Jpeg => "image/jpeg",
            Self::Png => "image/png",
            Self::Webp => "image/webp",
        }
    }
}

/// Detect the format of a header buffer. `None` means unsupported.
pub fn detect_bytes(header: &[u8]) -> Option<FileFormat> {
    if header.starts_with(b"%PDF-") {
        return Some(FileFormat::Pdf);
    }

    match image::guess_format(header).ok()? {
        ImageFormat::Jpeg => Some(FileFormat::Jpeg),
        ImageFormat::Png => Some(FileFormat::Png),
        // guess_format only looks at the RIFF container tag
        ImageFormat::WebP if header.len() >= 12 && &header[8..12] == b"WEBP" => {
            Some(FileFormat::Webp)
        }
        _ => None,
    }
}

/// Read the head of a local file and detect its format.
pub async fn detect_format(path: &Path) -> std::io::Result<Option<FileFormat>> {
    let file = tokio::fs::File::open(path).await?;
    let mut header = Vec::with_capacity(HEADER_LEN);
    file.take(HEADER_LEN as u64).read_to_end(&mut header).await?;

    let format = detect_bytes(&header);
    debug!(
        "Signature check for {}: {:?} ({} header bytes)",
        path.display(),
        format,
        header.len()
    );
    Ok(format)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{JPEG, PDF, PNG, WEBP};

    #[test]
    fn test_supported_signatures() {
        assert_eq!(detect_bytes(PDF), Some(FileFormat::Pdf));
        assert_eq!(detect_bytes(JPEG), Some(FileFormat::Jpeg));
        assert_eq!(detect_bytes(PNG), Some(FileFormat::Png));
        assert_eq!(detect_bytes(WEBP), Some(FileFormat::Webp));
    }

    #[test]
    fn test_extension_and_mime_pairs() {
        assert_eq!(
            (FileFormat::Pdf.extension(), FileFormat::Pdf.mime_type()),
            ("pdf", "application/pdf")
        );
        assert_eq!(
            (FileFormat::Jpeg.extension(), FileFormat::Jpeg.mime_type()),
            ("jpg", "image/jpeg")
        );
        assert_eq!(FileFormat::Png.mime_type(), "image/png");
        assert_eq!(FileFormat::Webp.extension(), "webp");
    }

    #[test]
    fn test_unsupported_signatures() {
        assert_eq!(detect_bytes(b""), None);
        assert_eq!(detect_bytes(b"%PD"), None);
        assert_eq!(detect_bytes(b"hello world, plain text"), None);
        assert_eq!(detect_bytes(b"GIF89a\x01\x00\x01\x00"), None);
        assert_eq!(detect_bytes(b"BM\x36\x00\x00\x00\x00\x00"), None);
        // RIFF container that is not WebP (WAV)
        assert_eq!(detect_bytes(b"RIFF\x24\x00\x00\x00WAVEfmt "), None);
        assert_eq!(detect_bytes(b"PK\x03\x04\x14\x00"), None);
    }

    #[tokio::test]
    async fn test_detect_format_reads_file_head() {
        let dir = tempfile::tempdir().unwrap();

        // named like a PDF, detected by content
        let png_path = dir.path().join("slip.pdf");
        let mut data = PNG.to_vec();
        data.extend_from_slice(&[0u8; 256]);
        std::fs::write(&png_path, &data).unwrap();
        assert_eq!(detect_format(&png_path).await.unwrap(), Some(FileFormat::Png));

        let empty = dir.path().join("empty");
        std::fs::write(&empty, b"").unwrap();
        assert_eq!(detect_format(&empty).await.unwrap(), None);

        assert!(detect_format(&dir.path().join("missing")).await.is_err());
    }
}

//! Content type sniffing and thumbnails for newly stored files.

use image::{DynamicImage, ImageFormat, ImageReader};
use std::io::Read;
use std::path::Path;

/// Bytes read from the head of a file when sniffing.
const SNIFF_LEN: u64 = 8 * 1024;

/// Longest thumbnail side in pixels.
pub const THUMBNAIL_MAX_SIDE: u32 = 300;

/// Decides the MIME type of stored content.
pub trait ContentSniffer: Send + Sync {
    /// Blocking.
    fn sniff(&self, path: &Path, filename: &str) -> String;
}

/// Magic-number sniffing with an extension fallback.
#[derive(Clone, Copy, Debug, Default)]
pub struct InferSniffer;

impl ContentSniffer for InferSniffer {
    fn sniff(&self, path: &Path, filename: &str) -> String {
        let mut head = Vec::with_capacity(SNIFF_LEN as usize);
        let read = std::fs::File::open(path).and_then(|f| f.take(SNIFF_LEN).read_to_end(&mut head));
        if let Err(e) = read {
            tracing::debug!(path = %path.display(), error = %e, "sniffing fell back to the filename");
        }
        if let Some(kind) = infer::get(&head) {
            return kind.mime_type().to_string();
        }
        mime_guess::from_path(filename)
            .first_or_octet_stream()
            .essence_str()
            .to_string()
    }
}

/// Produces thumbnails for image content.
pub trait Thumbnailer: Send + Sync {
    /// Whether content of `mime` can be thumbnailed.
    fn accepts(&self, mime: &str) -> bool;

    /// Blocking. Writes a thumbnail of `source` to `dest`.
    fn thumbnail(&self, source: &Path, dest: &Path) -> std::io::Result<()>;
}

/// JPEG thumbnails through the `image` crate.
#[derive(Clone, Copy, Debug)]
pub struct ImageThumbnailer {
    max_side: u32,
}

impl Default for ImageThumbnailer {
    fn default() -> Self {
        Self {
            max_side: THUMBNAIL_MAX_SIDE,
        }
    }
}

impl Thumbnailer for ImageThumbnailer {
    fn accepts(&self, mime: &str) -> bool {
        matches!(
            mime,
            "image/jpeg" | "image/png" | "image/gif" | "image/webp" | "image/bmp"
        )
    }

    fn thumbnail(&self, source: &Path, dest: &Path) -> std::io::Result<()> {
        let decoded = ImageReader::open(source)?
            .with_guessed_format()?
            .decode()
            .map_err(std::io::Error::other)?;
        // JPEG has no alpha channel.
        let small = DynamicImage::ImageRgb8(decoded.thumbnail(self.max_side, self.max_side).to_rgb8());
        small
            .save_with_format(dest, ImageFormat::Jpeg)
            .map_err(std::io::Error::other)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::GenericImageView;

    #[test]
    fn sniffing_prefers_content_over_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blob");
        let mut png = Vec::new();
        DynamicImage::new_rgb8(4, 4)
            .write_to(&mut std::io::Cursor::new(&mut png), ImageFormat::Png)
            .unwrap();
        std::fs::write(&path, &png).unwrap();
        assert_eq!(InferSniffer.sniff(&path, "holiday.txt"), "image/png");

        std::fs::write(&path, b"just words").unwrap();
        assert_eq!(InferSniffer.sniff(&path, "notes.txt"), "text/plain");
        assert_eq!(
            InferSniffer.sniff(&path, "no-extension"),
            "application/octet-stream"
        );
    }

    #[test]
    fn thumbnails_fit_the_max_side() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("big.png");
        DynamicImage::new_rgb8(900, 450)
            .save_with_format(&source, ImageFormat::Png)
            .unwrap();
        let dest = dir.path().join("thumb.jpg");

        let thumbnailer = ImageThumbnailer::default();
        assert!(thumbnailer.accepts("image/png"));
        assert!(!thumbnailer.accepts("video/mp4"));
        thumbnailer.thumbnail(&source, &dest).unwrap();

        let thumb = image::open(&dest).unwrap();
        assert_eq!(thumb.dimensions(), (300, 150));
    }

    #[test]
    fn undecodable_images_fail_without_panicking() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("fake.png");
        std::fs::write(&source, b"not an image").unwrap();
        assert!(
            ImageThumbnailer::default()
                .thumbnail(&source, &dir.path().join("t.jpg"))
                .is_err()
        );
    }
}

//! OBJ archive unpacking and MTL rewriting.
//!
//! 3D providers return either a ZIP (OBJ + MTL + texture) or a single-file
//! payload (GLB). The unpack step renames the parts to stable names under
//! the model's key prefix, which requires rewriting texture references
//! inside the MTL so they keep resolving. The rewrite is a pure text
//! transform: identical input bytes produce identical output.

use std::io::{Cursor, Read};

use zip::ZipArchive;

use crate::error::KilnError;

/// Texture map directives whose argument is a filename.
const TEXTURE_DIRECTIVES: &[&str] = &["map_Kd", "map_Ka", "map_Ks", "map_Bump", "map_d", "bump"];

/// Archive detection: ZIP local-file-header magic.
pub fn is_zip(bytes: &[u8]) -> bool {
    bytes.starts_with(b"PK")
}

#[derive(Debug)]
pub struct UnpackedObj {
    pub obj: Vec<u8>,
    /// MTL text with texture references already rewritten to the stable
    /// `material.<ext>` name.
    pub mtl: Option<Vec<u8>>,
    /// Texture bytes and their extension (`png` / `jpg` / `jpeg`).
    pub texture: Option<(Vec<u8>, String)>,
}

/// Unpack an OBJ archive.
///
/// Exactly one `.obj` entry is required: zero or several is a fatal error,
/// not a pick-the-first. At most one `.mtl` and one texture are used; when
/// several are present the first in archive order wins (archive order is
/// part of the input, so the result stays deterministic).
pub fn unpack_obj_archive(bytes: &[u8]) -> Result<UnpackedObj, KilnError> {
    let mut archive = ZipArchive::new(Cursor::new(bytes))
        .map_err(|e| KilnError::Parse(format!("unreadable archive: {e}")))?;

    let mut obj: Option<(String, Vec<u8>)> = None;
    let mut mtl: Option<(String, Vec<u8>)> = None;
    let mut texture: Option<(String, Vec<u8>)> = None;

    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|e| KilnError::Parse(format!("unreadable archive entry: {e}")))?;
        if entry.is_dir() {
            continue;
        }
        let name = entry.name().to_string();
        let lower = name.to_ascii_lowercase();

        if lower.ends_with(".obj") {
            if obj.is_some() {
                return Err(KilnError::Parse(
                    "archive contains more than one .obj entry".to_string(),
                ));
            }
            obj = Some((name, read_entry(&mut entry)?));
        } else if lower.ends_with(".mtl") {
            if mtl.is_none() {
                mtl = Some((name, read_entry(&mut entry)?));
            }
        } else if texture.is_none() && texture_ext(&lower).is_some() {
            texture = Some((name, read_entry(&mut entry)?));
        }
    }

    let (_, obj_bytes) = obj.ok_or_else(|| {
        KilnError::Parse("archive contains no .obj entry".to_string())
    })?;

    let texture_ext_owned = texture
        .as_ref()
        .and_then(|(name, _)| texture_ext(&name.to_ascii_lowercase()))
        .map(str::to_string);

    let mtl_bytes = match (&mtl, &texture) {
        (Some((_, mtl_bytes)), Some((texture_name, _))) => {
            let text = String::from_utf8_lossy(mtl_bytes);
            let ext = texture_ext_owned.as_deref().unwrap_or("png");
            Some(
                rewrite_mtl(&text, texture_name, &format!("material.{ext}"))
                    .into_bytes(),
            )
        }
        (Some((_, mtl_bytes)), None) => Some(mtl_bytes.clone()),
        (None, _) => None,
    };

    Ok(UnpackedObj {
        obj: obj_bytes,
        mtl: mtl_bytes,
        texture: texture.map(|(_, bytes)| {
            (bytes, texture_ext_owned.unwrap_or_else(|| "png".to_string()))
        }),
    })
}

fn read_entry(entry: &mut impl Read) -> Result<Vec<u8>, KilnError> {
    let mut buf = Vec::new();
    entry
        .read_to_end(&mut buf)
        .map_err(|e| KilnError::Parse(format!("unreadable archive entry: {e}")))?;
    Ok(buf)
}

pub fn texture_ext(lower_name: &str) -> Option<&'static str> {
    if lower_name.ends_with(".png") {
        Some("png")
    } else if lower_name.ends_with(".jpg") {
        Some("jpg")
    } else if lower_name.ends_with(".jpeg") {
        Some("jpeg")
    } else {
        None
    }
}

/// Rewrite references to `original` (its full archive path or bare
/// basename) into `replacement`. Texture-map directive lines and bare
/// references are rewritten; unrelated lines pass through byte-for-byte.
pub fn rewrite_mtl(mtl: &str, original: &str, replacement: &str) -> String {
    let basename = original.rsplit(['/', '\\']).next().unwrap_or(original);

    let mut out = String::with_capacity(mtl.len());
    for raw in mtl.split_inclusive('\n') {
        let (line, newline) = match raw.strip_suffix('\n') {
            Some(line) => (line, "\n"),
            None => (raw, ""),
        };
        if references_texture(line, original, basename) {
            out.push_str(&line.replace(original, replacement).replace(basename, replacement));
        } else {
            out.push_str(line);
        }
        out.push_str(newline);
    }
    out
}

fn references_texture(line: &str, original: &str, basename: &str) -> bool {
    let trimmed = line.trim_start();
    let directive = trimmed.split_whitespace().next().unwrap_or("");
    let is_map_line = TEXTURE_DIRECTIVES
        .iter()
        .any(|d| directive.eq_ignore_ascii_case(d));
    // Bare reference: the whole line is the filename.
    let is_bare = trimmed.trim_end() == original || trimmed.trim_end() == basename;
    (is_map_line && (line.contains(original) || line.contains(basename))) || is_bare
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use zip::write::SimpleFileOptions;

    fn build_zip(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut cursor = Cursor::new(Vec::new());
        {
            let mut writer = zip::ZipWriter::new(&mut cursor);
            let options = SimpleFileOptions::default()
                .compression_method(zip::CompressionMethod::Stored);
            for (name, bytes) in entries {
                writer.start_file(*name, options).unwrap();
                writer.write_all(bytes).unwrap();
            }
            writer.finish().unwrap();
        }
        cursor.into_inner()
    }

    #[test]
    fn zip_magic_is_detected() {
        assert!(is_zip(b"PK\x03\x04rest"));
        assert!(!is_zip(b"glTF binary"));
    }

    #[test]
    fn unpacks_obj_mtl_texture_and_rewrites_references() {
        let mtl = "newmtl body\nmap_Kd fox_texture.png\nKd 1.0 1.0 1.0\n";
        let bytes = build_zip(&[
            ("fox.obj", b"v 0 0 0\n"),
            ("fox.mtl", mtl.as_bytes()),
            ("fox_texture.png", b"\x89PNG fake"),
        ]);

        let unpacked = unpack_obj_archive(&bytes).unwrap();
        assert_eq!(unpacked.obj, b"v 0 0 0\n");
        let mtl_out = String::from_utf8(unpacked.mtl.unwrap()).unwrap();
        assert_eq!(mtl_out, "newmtl body\nmap_Kd material.png\nKd 1.0 1.0 1.0\n");
        let (texture, ext) = unpacked.texture.unwrap();
        assert_eq!(texture, b"\x89PNG fake");
        assert_eq!(ext, "png");
    }

    #[test]
    fn multiple_obj_entries_are_fatal() {
        let bytes = build_zip(&[("a.obj", b"v"), ("b.obj", b"v")]);
        let err = unpack_obj_archive(&bytes).unwrap_err();
        assert!(matches!(err, KilnError::Parse(_)));
    }

    #[test]
    fn missing_obj_entry_is_fatal() {
        let bytes = build_zip(&[("only.mtl", b"newmtl x\n")]);
        assert!(unpack_obj_archive(&bytes).is_err());
    }

    #[test]
    fn rewrite_covers_all_map_directives_and_bare_references() {
        let mtl = "map_Kd tex.jpg\nmap_Ka tex.jpg\nmap_Ks tex.jpg\n\
                   map_Bump tex.jpg\nmap_d tex.jpg\nbump tex.jpg\ntex.jpg\nKd 1 1 1\n";
        let out = rewrite_mtl(mtl, "tex.jpg", "material.jpg");
        assert_eq!(
            out,
            "map_Kd material.jpg\nmap_Ka material.jpg\nmap_Ks material.jpg\n\
             map_Bump material.jpg\nmap_d material.jpg\nbump material.jpg\n\
             material.jpg\nKd 1 1 1\n"
        );
    }

    #[test]
    fn rewrite_handles_archive_paths_and_options() {
        let mtl = "map_Kd -s 1 1 1 textures/tex.png\n";
        let out = rewrite_mtl(mtl, "textures/tex.png", "material.png");
        assert_eq!(out, "map_Kd -s 1 1 1 material.png\n");
    }

    #[test]
    fn rewrite_is_deterministic() {
        let mtl = "map_Kd skin.png\nillum 2\n";
        let a = rewrite_mtl(mtl, "skin.png", "material.png");
        let b = rewrite_mtl(mtl, "skin.png", "material.png");
        assert_eq!(a, b);
    }
}

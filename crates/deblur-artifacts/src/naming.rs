use std::path::{Path, PathBuf};

/// `{output_dir}/{stem}{suffix}.{extension}` for one input image.
pub fn output_path_for(input: &Path, output_dir: &Path, suffix: &str, extension: &str) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "image".to_string());
    output_dir.join(format!("{stem}{suffix}.{}", extension.trim_start_matches('.')))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_stem_and_swaps_extension() {
        let out = output_path_for(Path::new("/in/IMG_0001.PNG"), Path::new("/out"), "_clear", "jpg");
        assert_eq!(out, PathBuf::from("/out/IMG_0001_clear.jpg"));
        let out = output_path_for(Path::new("photo.tiff"), Path::new("o"), "", ".png");
        assert_eq!(out, PathBuf::from("o/photo.png"));
    }
}

//! Photo sets laid out the way uploads leave them on the jobs root
#![allow(dead_code)]

use std::io::Write;
use std::path::{Path, PathBuf};

/// Create `project_{id}/images` holding `count` photos spread over nested folders.
pub fn project_with_photos(jobs_root: &Path, project_id: i64, count: usize) -> PathBuf {
    let project = jobs_root.join(format!("project_{}", project_id));
    for index in 0..count {
        let folder = project.join("images").join(format!("orbit_{}", index % 2));
        std::fs::create_dir_all(&folder).unwrap();
        std::fs::write(folder.join(format!("view_{:02}.jpg", index)), b"\xFF\xD8\xFF\xE0").unwrap();
    }
    project
}

/// Create an empty project directory whose photos have not arrived yet.
pub fn project_without_images(jobs_root: &Path, project_id: i64) -> PathBuf {
    let project = jobs_root.join(format!("project_{}", project_id));
    std::fs::create_dir_all(&project).unwrap();
    project
}

/// Zip archive with `count` photos under a top-level folder.
pub fn photo_archive(count: usize) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
    let options = zip::write::SimpleFileOptions::default();
    for index in 0..count {
        writer
            .start_file(format!("shoot/IMG_{:04}.jpg", index), options)
            .unwrap();
        writer.write_all(b"\xFF\xD8\xFF\xE0").unwrap();
    }
    writer.finish().unwrap().into_inner()
}

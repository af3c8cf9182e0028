//! 状态目录与输出文件命名。

use std::path::{Path, PathBuf};

use crate::base_system::context::safe_fs_name;

/// 进度状态目录：`<save_dir>/<book_id>_status/`，与书名无关，保证续传时路径稳定。
pub fn status_folder_path(save_dir: &Path, book_id: &str) -> PathBuf {
    save_dir.join(format!("{}_status", safe_fs_name(book_id, "_", 120)))
}

/// 输出文件名：全本为 `书名.ext`，区间为 `书名_起-止.ext`，不同区间互不覆盖。
pub fn output_file_name(book_name: &str, range: Option<(u32, u32)>, ext: &str) -> String {
    let safe_book = safe_fs_name(book_name, "_", 120);
    match range {
        Some((start, end)) => format!("{safe_book}_{start}-{end}.{ext}"),
        None => format!("{safe_book}.{ext}"),
    }
}

/// 选出不会覆盖已有文件的路径：`name.ext` → `name (2).ext` → `name (3).ext` ...
pub fn non_clobbering_path(dir: &Path, file_name: &str) -> PathBuf {
    let candidate = dir.join(file_name);
    if !candidate.exists() {
        return candidate;
    }
    let (stem, ext) = match file_name.rsplit_once('.') {
        Some((s, e)) => (s, Some(e)),
        None => (file_name, None),
    };
    let mut n = 2u32;
    loop {
        let name = match ext {
            Some(e) => format!("{stem} ({n}).{e}"),
            None => format!("{stem} ({n})"),
        };
        let path = dir.join(name);
        if !path.exists() {
            return path;
        }
        n += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_is_part_of_the_file_name() {
        assert_eq!(output_file_name("书名", None, "txt"), "书名.txt");
        assert_eq!(output_file_name("书名", Some((3, 9)), "epub"), "书名_3-9.epub");
    }

    #[test]
    fn existing_files_get_numbered_siblings() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(non_clobbering_path(dir.path(), "a.txt"), dir.path().join("a.txt"));

        std::fs::write(dir.path().join("a.txt"), "x").unwrap();
        std::fs::write(dir.path().join("a (2).txt"), "x").unwrap();
        assert_eq!(
            non_clobbering_path(dir.path(), "a.txt"),
            dir.path().join("a (3).txt")
        );
    }
}

//! Search queries: NMDC `$Search` criteria and matching against shared paths.

use crate::tth::TthValue;

/// Size restriction of a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeMode {
    Any,
    AtLeast(u64),
    AtMost(u64),
}

/// NMDC search data type (`1`..=`9`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileType {
    Any,
    Audio,
    Compressed,
    Document,
    Executable,
    Picture,
    Video,
    Folder,
    Tth,
}

impl FileType {
    pub fn code(self) -> u8 {
        match self {
            FileType::Any => 1,
            FileType::Audio => 2,
            FileType::Compressed => 3,
            FileType::Document => 4,
            FileType::Executable => 5,
            FileType::Picture => 6,
            FileType::Video => 7,
            FileType::Folder => 8,
            FileType::Tth => 9,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            1 => FileType::Any,
            2 => FileType::Audio,
            3 => FileType::Compressed,
            4 => FileType::Document,
            5 => FileType::Executable,
            6 => FileType::Picture,
            7 => FileType::Video,
            8 => FileType::Folder,
            9 => FileType::Tth,
            _ => return None,
        })
    }

    fn extensions(self) -> &'static [&'static str] {
        match self {
            FileType::Audio => &["mp3", "mp2", "wav", "au", "rm", "mid", "sm", "flac", "ogg", "m4a", "ape", "wma"],
            FileType::Compressed => &["zip", "arj", "rar", "lzh", "gz", "z", "arc", "pak", "7z", "bz2", "xz"],
            FileType::Document => &["doc", "txt", "wri", "pdf", "ps", "tex", "docx", "odt", "rtf", "epub"],
            FileType::Executable => &["pm", "exe", "bat", "com", "msi", "sh"],
            FileType::Picture => &["gif", "jpg", "jpeg", "bmp", "pcx", "png", "wmf", "psd", "tif", "tiff", "webp"],
            FileType::Video => &["mpg", "mpeg", "avi", "asf", "mov", "mkv", "mp4", "wmv", "webm", "m4v"],
            FileType::Any | FileType::Folder | FileType::Tth => &[],
        }
    }

    /// Whether a file name passes the type filter (folders and TTH are handled by the caller).
    pub fn accepts_file(self, name: &str) -> bool {
        match self {
            FileType::Any => true,
            FileType::Folder | FileType::Tth => false,
            other => {
                let ext = name
                    .rsplit_once('.')
                    .map(|(_, e)| e.to_ascii_lowercase())
                    .unwrap_or_default();
                other.extensions().contains(&ext.as_str())
            }
        }
    }
}

/// A parsed search.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchQuery {
    pub size: SizeMode,
    pub file_type: FileType,
    /// Lowercased terms; every one must appear in the path.
    pub terms: Vec<String>,
    pub tth: Option<TthValue>,
}

impl SearchQuery {
    pub fn by_terms(text: &str) -> Self {
        Self {
            size: SizeMode::Any,
            file_type: FileType::Any,
            terms: text
                .split_whitespace()
                .map(|t| t.to_lowercase())
                .collect(),
            tth: None,
        }
    }

    pub fn by_tth(root: TthValue) -> Self {
        Self {
            size: SizeMode::Any,
            file_type: FileType::Tth,
            terms: Vec::new(),
            tth: Some(root),
        }
    }

    pub fn with_size(mut self, size: SizeMode) -> Self {
        self.size = size;
        self
    }

    pub fn with_type(mut self, file_type: FileType) -> Self {
        self.file_type = file_type;
        self
    }

    /// Deduplication key: the normalized criteria string.
    pub fn token(&self) -> String {
        match &self.tth {
            Some(root) => format!("TTH:{}", root),
            None => {
                let (restricted, is_max, size) = self.size_fields();
                format!(
                    "{}?{}?{}?{}?{}",
                    restricted,
                    is_max,
                    size,
                    self.file_type.code(),
                    self.terms.join(" ")
                )
            }
        }
    }

    /// `(sizerestricted, ismaxsize, size)` as NMDC flags.
    pub fn size_fields(&self) -> (char, char, u64) {
        match self.size {
            SizeMode::Any => ('F', 'T', 0),
            SizeMode::AtLeast(n) => ('T', 'F', n),
            SizeMode::AtMost(n) => ('T', 'T', n),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.tth.is_none() && self.terms.is_empty()
    }

    pub fn size_matches(&self, size: u64) -> bool {
        match self.size {
            SizeMode::Any => true,
            SizeMode::AtLeast(n) => size >= n,
            SizeMode::AtMost(n) => size <= n,
        }
    }

    /// Terms are matched case-insensitively against `haystack` (a virtual path).
    pub fn terms_match(&self, haystack: &str) -> bool {
        let lower = haystack.to_lowercase();
        self.terms.iter().all(|t| lower.contains(t.as_str()))
    }

    pub fn matches_file(&self, virtual_path: &str, size: u64, tth: Option<&TthValue>) -> bool {
        if let Some(root) = &self.tth {
            return tth == Some(root);
        }
        if self.file_type == FileType::Folder {
            return false;
        }
        let name = virtual_path.rsplit('\\').next().unwrap_or(virtual_path);
        self.size_matches(size) && self.file_type.accepts_file(name) && self.terms_match(virtual_path)
    }

    pub fn matches_folder(&self, virtual_dir: &str) -> bool {
        if self.tth.is_some() || self.terms.is_empty() {
            return false;
        }
        matches!(self.file_type, FileType::Any | FileType::Folder) && self.terms_match(virtual_dir)
    }
}

/// One local hit for a query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchHit {
    pub virtual_path: String,
    pub size: u64,
    pub tth: Option<TthValue>,
    pub is_dir: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tth::leaf_hash;

    #[test]
    fn terms_are_case_insensitive_and_all_required() {
        let q = SearchQuery::by_terms("Report PDF");
        assert!(q.matches_file("Docs\\Annual report.pdf", 10, None));
        assert!(!q.matches_file("Docs\\Annual report.doc", 10, None));
    }

    #[test]
    fn size_restrictions() {
        let q = SearchQuery::by_terms("a").with_size(SizeMode::AtLeast(100));
        assert!(q.matches_file("a", 100, None));
        assert!(!q.matches_file("a", 99, None));
        let q = SearchQuery::by_terms("a").with_size(SizeMode::AtMost(100));
        assert!(!q.matches_file("a", 101, None));
    }

    #[test]
    fn type_filter_uses_extension() {
        let q = SearchQuery::by_terms("song").with_type(FileType::Audio);
        assert!(q.matches_file("Music\\song.FLAC", 1, None));
        assert!(!q.matches_file("Music\\song.txt", 1, None));
    }

    #[test]
    fn tth_matches_exactly() {
        let root = leaf_hash(b"x");
        let q = SearchQuery::by_tth(root);
        assert!(q.matches_file("anything", 1, Some(&root)));
        assert!(!q.matches_file("anything", 1, Some(&leaf_hash(b"y"))));
        assert!(!q.matches_file("anything", 1, None));
    }

    #[test]
    fn folder_queries() {
        let q = SearchQuery::by_terms("album").with_type(FileType::Folder);
        assert!(q.matches_folder("Music\\Album 1"));
        assert!(!q.matches_file("Music\\Album 1\\a.mp3", 1, None));
    }

    #[test]
    fn token_normalizes() {
        let a = SearchQuery::by_terms("report.pdf");
        let b = SearchQuery::by_terms("  REPORT.pdf ");
        assert_eq!(a.token(), b.token());
        assert_ne!(a.token(), a.clone().with_type(FileType::Document).token());
    }
}

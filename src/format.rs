//! Format detection for uploaded and fetched artifacts.
//!
//! Uploads are classified by filename extension, URL downloads by the
//! response `Content-Type`.

use std::fmt;

use crate::error::DataError;

/// Every artifact format the service knows how to route.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FormatTag {
    Csv,
    Json,
    Npy,
    Pickle,
    /// HDF5 or native Keras archive.
    Hdf5,
}

impl FormatTag {
    pub fn name(self) -> &'static str {
        match self {
            FormatTag::Csv => "csv",
            FormatTag::Json => "json",
            FormatTag::Npy => "npy",
            FormatTag::Pickle => "pickle",
            FormatTag::Hdf5 => "h5-or-keras",
        }
    }

    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "csv" => Some(FormatTag::Csv),
            "json" => Some(FormatTag::Json),
            "npy" => Some(FormatTag::Npy),
            "pkl" => Some(FormatTag::Pickle),
            "h5" | "keras" => Some(FormatTag::Hdf5),
            _ => None,
        }
    }

    /// Detects the format of an uploaded file.
    pub fn detect_filename(filename: &str) -> Result<Self, DataError> {
        let ext = extension_of(filename);
        Self::from_extension(&ext).ok_or(DataError::UnsupportedFormat(ext))
    }

    /// Detects the format of a downloaded body by substring matching on the
    /// `Content-Type` header.
    pub fn detect_content_type(content_type: &str) -> Result<Self, DataError> {
        let lower = content_type.to_ascii_lowercase();
        if lower.contains("text/csv") {
            Ok(FormatTag::Csv)
        } else if lower.contains("application/json") {
            Ok(FormatTag::Json)
        } else if lower.contains("application/octet-stream") {
            Ok(FormatTag::Npy)
        } else {
            Err(DataError::UnsupportedFormat(content_type.to_string()))
        }
    }
}

impl fmt::Display for FormatTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Lowercased suffix after the last `.`; the whole name when there is none.
pub fn extension_of(filename: &str) -> String {
    filename
        .rsplit('.')
        .next()
        .unwrap_or(filename)
        .to_ascii_lowercase()
}

/// Extension of the last path segment of a URL, ignoring query and fragment.
pub fn url_extension(url: &str) -> String {
    match reqwest::Url::parse(url) {
        Ok(parsed) => {
            let last = parsed
                .path_segments()
                .and_then(|mut segments| segments.next_back())
                .unwrap_or("");
            extension_of(last)
        }
        Err(_) => {
            let path = url.split(['?', '#']).next().unwrap_or(url);
            extension_of(path)
        }
    }
}

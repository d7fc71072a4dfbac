use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct Pagination {
    #[serde(default)]
    pub skip: usize,
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    100
}

/// Fields collected from the multipart batch upload form
#[derive(Debug, Default)]
pub struct BatchUpload {
    pub name: Option<String>,
    pub template_id: Option<String>,
    pub files: Vec<UploadedFile>,
}

#[derive(Debug)]
pub struct UploadedFile {
    pub filename: String,
    pub content: Vec<u8>,
}

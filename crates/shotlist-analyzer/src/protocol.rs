//! Worker line protocol.
//!
//! ```text
//! worker  -> parent   READY
//! parent  -> worker   DETECT|<inputPath>|<jobId>|<outputDir>
//! worker  -> parent   DETECT_DONE|<json array of shots>
//! parent  -> worker   <recordPath>
//! worker  -> parent   DONE:<anything>
//! parent  -> worker   EXIT
//! ```
//!
//! Frames carry no correlation id. The channel pairs each response with the
//! oldest pending request expecting that response kind.

use std::fmt;
use std::path::{Path, PathBuf};

use shotlist_models::{JobId, Shot};

use crate::error::{AnalyzerError, AnalyzerResult};

const FIELD_DELIMITER: char = '|';
const READY: &str = "READY";
const DETECT_PREFIX: &str = "DETECT|";
const DETECT_DONE_PREFIX: &str = "DETECT_DONE|";
const DONE_PREFIX: &str = "DONE:";
const EXIT: &str = "EXIT";

/// Request written to the worker's stdin.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    /// Run shot detection; screenshots land in `output_dir`.
    Detect {
        input_path: PathBuf,
        job_id: JobId,
        output_dir: PathBuf,
    },
    /// Describe every undescribed shot in the record at `record_path`.
    Describe { record_path: PathBuf },
    /// Ask the worker to exit.
    Exit,
}

impl Request {
    pub fn detect(
        input_path: impl Into<PathBuf>,
        job_id: JobId,
        output_dir: impl Into<PathBuf>,
    ) -> Self {
        Self::Detect {
            input_path: input_path.into(),
            job_id,
            output_dir: output_dir.into(),
        }
    }

    pub fn describe(record_path: impl Into<PathBuf>) -> Self {
        Self::Describe {
            record_path: record_path.into(),
        }
    }

    /// Response kind that settles this request, `None` for fire-and-forget.
    pub fn expected_response(&self) -> Option<ResponseKind> {
        match self {
            Request::Detect { .. } => Some(ResponseKind::DetectDone),
            Request::Describe { .. } => Some(ResponseKind::Done),
            Request::Exit => None,
        }
    }

    pub fn opcode(&self) -> &'static str {
        match self {
            Request::Detect { .. } => "DETECT",
            Request::Describe { .. } => "DESCRIBE",
            Request::Exit => EXIT,
        }
    }

    /// Serialize to a single line, without the terminator.
    pub fn encode(&self) -> AnalyzerResult<String> {
        match self {
            Request::Detect {
                input_path,
                job_id,
                output_dir,
            } => {
                let input = path_field("input path", input_path)?;
                let id = text_field("job id", job_id.as_str())?;
                let output = path_field("output dir", output_dir)?;
                Ok(format!("DETECT|{}|{}|{}", input, id, output))
            }
            Request::Describe { record_path } => {
                let path = path_field("record path", record_path)?;
                // A bare line is only a describe request if it cannot be read as another opcode.
                if path.starts_with(DETECT_PREFIX) || path == EXIT {
                    return Err(AnalyzerError::invalid_request(format!(
                        "record path is ambiguous on the wire: {}",
                        path
                    )));
                }
                Ok(path.to_string())
            }
            Request::Exit => Ok(EXIT.to_string()),
        }
    }
}

fn path_field<'a>(name: &str, path: &'a Path) -> AnalyzerResult<&'a str> {
    let s = path
        .to_str()
        .ok_or_else(|| AnalyzerError::invalid_request(format!("{} is not UTF-8", name)))?;
    text_field(name, s)
}

fn text_field<'a>(name: &str, value: &'a str) -> AnalyzerResult<&'a str> {
    if value.is_empty() {
        return Err(AnalyzerError::invalid_request(format!("{} is empty", name)));
    }
    if value.contains(FIELD_DELIMITER) || value.contains('\n') || value.contains('\r') {
        return Err(AnalyzerError::invalid_request(format!(
            "{} contains a reserved character: {}",
            name, value
        )));
    }
    Ok(value)
}

/// Kinds of response frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResponseKind {
    Ready,
    DetectDone,
    Done,
}

impl ResponseKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResponseKind::Ready => "READY",
            ResponseKind::DetectDone => "DETECT_DONE",
            ResponseKind::Done => "DONE",
        }
    }
}

impl fmt::Display for ResponseKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Parsed response frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    Ready,
    DetectDone(Vec<Shot>),
    Done(String),
}

/// A recognized opcode whose payload did not parse.
#[derive(Debug, Clone, PartialEq)]
pub struct MalformedFrame {
    pub kind: ResponseKind,
    pub reason: String,
}

impl Response {
    pub fn kind(&self) -> ResponseKind {
        match self {
            Response::Ready => ResponseKind::Ready,
            Response::DetectDone(_) => ResponseKind::DetectDone,
            Response::Done(_) => ResponseKind::Done,
        }
    }

    /// Classify one line.
    ///
    /// `Ok(None)` means the line is not a protocol frame at all.
    pub fn parse(line: &str) -> Result<Option<Response>, MalformedFrame> {
        let line = line.trim_end();
        if line == READY {
            return Ok(Some(Response::Ready));
        }
        if let Some(payload) = line.strip_prefix(DETECT_DONE_PREFIX) {
            return serde_json::from_str::<Vec<Shot>>(payload)
                .map(|shots| Some(Response::DetectDone(shots)))
                .map_err(|e| MalformedFrame {
                    kind: ResponseKind::DetectDone,
                    reason: format!("invalid shot list: {}", e),
                });
        }
        if let Some(payload) = line.strip_prefix(DONE_PREFIX) {
            return Ok(Some(Response::Done(payload.to_string())));
        }
        Ok(None)
    }
}

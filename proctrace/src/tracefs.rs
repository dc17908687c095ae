//! tracefs 查找与 `format` 文件解析。
//!
//! 探针按固定偏移读取 tracepoint 参数，偏移取自 `events/<category>/<name>/format`，
//! 内核移动字段或把内联 `char[16]` 改成 `__data_loc char[]` 时仍然正确。

use proctrace_common::layout::{ExecLayout, ExitLayout, ForkLayout, StrField};
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

pub const DEFAULT_ROOTS: [&str; 2] = ["/sys/kernel/tracing", "/sys/kernel/debug/tracing"];

#[derive(Debug, Clone)]
pub struct Tracefs {
    root: PathBuf,
}

impl Tracefs {
    pub fn at(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// 显式指定的根目录优先；否则取第一个包含 events/ 的默认挂载点
    pub fn locate(override_root: Option<&Path>) -> Option<Self> {
        if let Some(root) = override_root {
            return Some(Self::at(root));
        }
        DEFAULT_ROOTS
            .iter()
            .map(Path::new)
            .find(|root| root.join("events").is_dir())
            .map(Self::at)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn event_dir(&self, category: &str, name: &str) -> PathBuf {
        self.root.join("events").join(category).join(name)
    }

    pub fn has_event(&self, category: &str, name: &str) -> bool {
        self.event_dir(category, name).join("format").is_file()
    }

    pub fn read_format(&self, category: &str, name: &str) -> Result<TracepointFormat, FormatError> {
        let path = self.event_dir(category, name).join("format");
        let text = fs::read_to_string(&path)?;
        TracepointFormat::parse(&text)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldFormat {
    pub name: String,
    /// 去掉字段名的 C 声明，例如 `char[16]`、`const char *`
    pub decl: String,
    pub offset: u32,
    pub size: u32,
    pub data_loc: bool,
}

impl FieldFormat {
    pub fn is_array(&self) -> bool {
        self.decl.contains('[')
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TracepointFormat {
    pub name: String,
    pub fields: Vec<FieldFormat>,
}

#[derive(Debug)]
pub enum FormatError {
    Io(io::Error),
    Malformed { line: String },
}

impl fmt::Display for FormatError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FormatError::Io(e) => write!(f, "failed to read tracepoint format: {}", e),
            FormatError::Malformed { line } => write!(f, "malformed format line: '{}'", line),
        }
    }
}

impl std::error::Error for FormatError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            FormatError::Io(e) => Some(e),
            FormatError::Malformed { .. } => None,
        }
    }
}

impl From<io::Error> for FormatError {
    fn from(err: io::Error) -> FormatError {
        FormatError::Io(err)
    }
}

impl TracepointFormat {
    pub fn parse(text: &str) -> Result<Self, FormatError> {
        let mut format = TracepointFormat::default();
        for line in text.lines() {
            let trimmed = line.trim();
            if let Some(name) = trimmed.strip_prefix("name:") {
                format.name = name.trim().to_string();
            } else if trimmed.starts_with("field:") {
                format.fields.push(parse_field(trimmed)?);
            }
        }
        Ok(format)
    }

    pub fn field(&self, name: &str) -> Option<&FieldFormat> {
        self.fields.iter().find(|f| f.name == name)
    }
}

// 形如：field:char parent_comm[16];	offset:8;	size:16;	signed:0;
fn parse_field(line: &str) -> Result<FieldFormat, FormatError> {
    let malformed = || FormatError::Malformed {
        line: line.to_string(),
    };

    let mut declaration = None;
    let mut offset = None;
    let mut size = None;
    for part in line.split(';').map(str::trim).filter(|p| !p.is_empty()) {
        let (key, value) = part.split_once(':').ok_or_else(malformed)?;
        match key.trim() {
            "field" => declaration = Some(value.trim()),
            "offset" => offset = value.trim().parse::<u32>().ok(),
            "size" => size = value.trim().parse::<u32>().ok(),
            _ => {}
        }
    }
    let declaration = declaration.ok_or_else(malformed)?;
    let offset = offset.ok_or_else(malformed)?;
    let size = size.ok_or_else(malformed)?;

    // 字段名是最后一个标识符，去掉数组后缀和指针星号
    let last = declaration.split_whitespace().last().ok_or_else(malformed)?;
    let (ident, array_suffix) = match last.find('[') {
        Some(idx) => (&last[..idx], &last[idx..]),
        None => (last, ""),
    };
    let ident = ident.trim_start_matches('*');
    if ident.is_empty() {
        return Err(malformed());
    }
    let prefix = declaration[..declaration.len() - last.len()].trim_end();
    let data_loc = prefix.starts_with("__data_loc");
    let decl = format!("{}{}", prefix, array_suffix);

    Ok(FieldFormat {
        name: ident.to_string(),
        decl,
        offset,
        size,
        data_loc,
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LayoutError {
    MissingField(&'static str),
    UnexpectedField {
        field: &'static str,
        reason: &'static str,
    },
}

impl fmt::Display for LayoutError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LayoutError::MissingField(name) => write!(f, "field '{}' not present", name),
            LayoutError::UnexpectedField { field, reason } => {
                write!(f, "field '{}' has unexpected type: {}", field, reason)
            }
        }
    }
}

impl std::error::Error for LayoutError {}

fn require<'a>(format: &'a TracepointFormat, name: &'static str) -> Result<&'a FieldFormat, LayoutError> {
    format.field(name).ok_or(LayoutError::MissingField(name))
}

fn id_field(format: &TracepointFormat, name: &'static str) -> Result<u32, LayoutError> {
    let field = require(format, name)?;
    if field.size != 4 {
        return Err(LayoutError::UnexpectedField {
            field: name,
            reason: "expected a 4-byte pid_t",
        });
    }
    Ok(field.offset)
}

fn str_field(format: &TracepointFormat, name: &'static str) -> Result<StrField, LayoutError> {
    let field = require(format, name)?;
    if field.data_loc {
        Ok(StrField::data_loc(field.offset))
    } else if field.is_array() {
        Ok(StrField::inline(field.offset))
    } else {
        Err(LayoutError::UnexpectedField {
            field: name,
            reason: "expected char[] or __data_loc char[]",
        })
    }
}

/// `syscalls:sys_enter_execve` / `sys_enter_execveat` 的布局
pub fn exec_layout(format: &TracepointFormat) -> Result<ExecLayout, LayoutError> {
    let field = require(format, "filename")?;
    if field.size != 8 {
        return Err(LayoutError::UnexpectedField {
            field: "filename",
            reason: "expected a user pointer",
        });
    }
    Ok(ExecLayout {
        filename: field.offset,
    })
}

pub fn fork_layout(format: &TracepointFormat) -> Result<ForkLayout, LayoutError> {
    Ok(ForkLayout {
        parent_comm: str_field(format, "parent_comm")?,
        child_comm: str_field(format, "child_comm")?,
        parent_pid: id_field(format, "parent_pid")?,
        child_pid: id_field(format, "child_pid")?,
    })
}

pub fn exit_layout(format: &TracepointFormat) -> Result<ExitLayout, LayoutError> {
    Ok(ExitLayout {
        comm: str_field(format, "comm")?,
        pid: id_field(format, "pid")?,
    })
}

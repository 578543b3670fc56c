//! AFC operation codes and open modes.

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u64)]
pub enum AfcOpcode {
    Status = 0x01,
    Data = 0x02,
    ReadDir = 0x03,
    RemovePath = 0x08,
    MakeDir = 0x09,
    GetFileInfo = 0x0a,
    GetDevInfo = 0x0b,
    FileOpen = 0x0d,
    FileOpenRes = 0x0e,
    Read = 0x0f,
    Write = 0x10,
    FileSeek = 0x11,
    FileTell = 0x12,
    FileTellRes = 0x13,
    FileClose = 0x14,
    RenamePath = 0x18,
    MakeLink = 0x1c,
}

impl TryFrom<u64> for AfcOpcode {
    type Error = u64;

    fn try_from(value: u64) -> Result<Self, u64> {
        Ok(match value {
            0x01 => Self::Status,
            0x02 => Self::Data,
            0x03 => Self::ReadDir,
            0x08 => Self::RemovePath,
            0x09 => Self::MakeDir,
            0x0a => Self::GetFileInfo,
            0x0b => Self::GetDevInfo,
            0x0d => Self::FileOpen,
            0x0e => Self::FileOpenRes,
            0x0f => Self::Read,
            0x10 => Self::Write,
            0x11 => Self::FileSeek,
            0x12 => Self::FileTell,
            0x13 => Self::FileTellRes,
            0x14 => Self::FileClose,
            0x18 => Self::RenamePath,
            0x1c => Self::MakeLink,
            other => return Err(other),
        })
    }
}

/// File open disposition, mirroring the usual `fopen` modes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u64)]
pub enum AfcFopenMode {
    /// `r`
    RdOnly = 0x1,
    /// `r+`
    Rw = 0x2,
    /// `w`
    WrOnly = 0x3,
    /// `w+`
    Wr = 0x4,
    /// `a`
    Append = 0x5,
    /// `a+`
    RdAppend = 0x6,
}

/// Status codes carried in `Status` replies.
pub(crate) fn status_description(code: u64) -> &'static str {
    match code {
        0 => "success",
        1 => "unknown error",
        2 => "op header invalid",
        3 => "no resources",
        4 => "read error",
        5 => "write error",
        6 => "unknown packet type",
        7 => "invalid argument",
        8 => "object not found",
        9 => "object is a directory",
        10 => "permission denied",
        11 => "service not connected",
        12 => "operation timed out",
        13 => "too much data",
        14 => "end of data",
        15 => "operation not supported",
        16 => "object exists",
        17 => "object busy",
        18 => "no space left",
        19 => "operation would block",
        20 => "io error",
        21 => "operation interrupted",
        22 => "operation in progress",
        23 => "internal error",
        _ => "unrecognized status",
    }
}

/// Per-item problem codes. Every queue item in an error state carries one of
/// these; the value selects which resolutions the host may offer (see the
/// policy tables in `config.rs`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProblemKind {
    #[default]
    Ok,
    LowMem,
    CannotCreateTgtFile,
    CannotCreateTgtDir,
    TgtFileAlreadyExists,
    TgtDirAlreadyExists,
    RetryOnCreatedFile,
    RetryOnResumedFile,
    AsciiTransferForBinaryFile,
    UnknownAttrs,
    InvalidPathToDir,
    UnableToChangeDir,
    UnableToGetWorkingDir,
    DirExploreEndlessLoop,
    ListenFailure,
    IncompleteListing,
    UnableToParseListing,
    DirIsHidden,
    DirIsNotEmpty,
    FileIsHidden,
    InvalidPathToLink,
    UnableToResolveLink,
    UnableToDeleteFile,
    UnableToDeleteDir,
    UnableToChangeAttrs,
    UnableToResume,
    ResumeTestFailed,
    TgtFileReadError,
    TgtFileWriteError,
    IncompleteDownload,
    UnableToDeleteSourceFile,
    UploadCannotCreateTgtDir,
    UploadCannotListTgtPath,
    UploadTgtDirAlreadyExists,
    UploadCrDirAutoRenFailed,
    UploadCannotListSrcPath,
    UnableToChangeToPathOnly,
    UnableToDeleteDiskDir,
    UploadCannotCreateTgtFile,
    UploadCannotOpenSrcFile,
    UploadTgtFileAlreadyExists,
    SrcFileInUse,
    TgtFileInUse,
    SrcFileReadError,
    IncompleteUpload,
    UnableToDeleteDiskFile,
    UploadAsciiResumeNotSupported,
    UploadUnableToResumeUnknownSize,
    UploadUnableToResumeBiggerTgt,
    UploadFileAutoRenFailed,
    SkippedByUser,
    UploadTestIfFinishedNotSupported,
}

impl ProblemKind {
    /// Problems nobody can solve interactively; "Solve" is disabled for them
    /// and only Skip/Retry make sense.
    pub fn is_unsolvable(self) -> bool {
        use ProblemKind::*;
        matches!(
            self,
            LowMem
                | InvalidPathToDir
                | DirExploreEndlessLoop
                | InvalidPathToLink
                | SkippedByUser
                | UploadCrDirAutoRenFailed
                | UploadFileAutoRenFailed
        )
    }

    /// Whether the problem stores a verbatim server reply in the item's
    /// error description.
    pub fn keeps_server_reply(self) -> bool {
        use ProblemKind::*;
        matches!(
            self,
            UnableToChangeDir
                | UnableToGetWorkingDir
                | IncompleteListing
                | UnableToResolveLink
                | UnableToDeleteFile
                | UnableToDeleteDir
                | UnableToChangeAttrs
                | IncompleteDownload
                | UnableToDeleteSourceFile
                | UploadCannotCreateTgtDir
                | UploadCannotListTgtPath
                | UploadCrDirAutoRenFailed
                | UnableToChangeToPathOnly
                | UploadCannotCreateTgtFile
                | IncompleteUpload
                | UploadFileAutoRenFailed
        )
    }

    /// Base text shown to the user; `describe` appends the OS error and the
    /// stored free-text detail when present.
    fn base_text(self) -> &'static str {
        use ProblemKind::*;
        match self {
            Ok => "no problem",
            LowMem => "insufficient system resources",
            CannotCreateTgtFile => "unable to create or open the target file",
            CannotCreateTgtDir => "unable to create the target directory",
            TgtFileAlreadyExists => "the target file already exists",
            TgtDirAlreadyExists => "the target directory already exists",
            RetryOnCreatedFile => "retry on a file created by this operation",
            RetryOnResumedFile => "retry on a file resumed by this operation",
            AsciiTransferForBinaryFile => "ASCII transfer mode used for a binary file",
            UnknownAttrs => "the file or directory has attributes that cannot be preserved",
            InvalidPathToDir => "the path to the directory is too long or invalid",
            UnableToChangeDir => "unable to change the working directory on the server",
            UnableToGetWorkingDir => "unable to query the working directory on the server",
            DirExploreEndlessLoop => "exploring this directory would loop forever",
            ListenFailure => "unable to prepare an active data connection",
            IncompleteListing => "unable to read the full directory listing from the server",
            UnableToParseListing => "unknown format of the server directory listing",
            DirIsHidden => "the directory is hidden",
            DirIsNotEmpty => "the directory is not empty",
            FileIsHidden => "the file is hidden",
            InvalidPathToLink => "the full name of the link is too long or invalid",
            UnableToResolveLink => "unable to tell a directory link from a file link",
            UnableToDeleteFile => "unable to delete the file on the server",
            UnableToDeleteDir => "unable to delete the directory on the server",
            UnableToChangeAttrs => "unable to change attributes on the server",
            UnableToResume => "unable to resume the file transfer",
            ResumeTestFailed => "unable to resume, the file tail has changed",
            TgtFileReadError => "error reading the target file",
            TgtFileWriteError => "error writing the target file",
            IncompleteDownload => "unable to retrieve the file from the server",
            UnableToDeleteSourceFile => "unable to delete the source file on the server",
            UploadCannotCreateTgtDir => "unable to create the target directory on the server",
            UploadCannotListTgtPath => "unable to list the target path on the server",
            UploadTgtDirAlreadyExists => "the target directory or directory link already exists",
            UploadCrDirAutoRenFailed => "unable to create the target directory under any name",
            UploadCannotListSrcPath => "unable to list the source path on disk",
            UnableToChangeToPathOnly => "unable to change to the working path on the server",
            UnableToDeleteDiskDir => "unable to delete the directory on disk",
            UploadCannotCreateTgtFile => "unable to create or open the target file on the server",
            UploadCannotOpenSrcFile => "unable to open the source file on disk",
            UploadTgtFileAlreadyExists => "the target file or file link already exists",
            SrcFileInUse => "the source file or link is locked by another operation",
            TgtFileInUse => "the target file or link is locked by another operation",
            SrcFileReadError => "error reading the source file",
            IncompleteUpload => "unable to store the file to the server",
            UnableToDeleteDiskFile => "unable to delete the file on disk",
            UploadAsciiResumeNotSupported => "resume in ASCII transfer mode is not supported",
            UploadUnableToResumeUnknownSize => "unable to resume, the target file size is unknown",
            UploadUnableToResumeBiggerTgt => {
                "unable to resume, the target file is larger than the source"
            }
            UploadFileAutoRenFailed => "unable to create the target file under any name",
            SkippedByUser => "skipped by user",
            UploadTestIfFinishedNotSupported => {
                "unable to verify whether the file uploaded completely"
            }
        }
    }

    /// Full user-facing description combining the base text with the OS error
    /// number and the stored free-text detail (usually a verbatim server
    /// reply, possibly multi-line).
    pub fn describe(self, os_error: Option<i32>, detail: Option<&str>) -> String {
        let mut text = self.base_text().to_string();
        if let Some(code) = os_error {
            text.push_str(&format!(" (os error {})", code));
        }
        if let Some(d) = detail {
            let d = d.trim_end();
            if !d.is_empty() {
                text.push_str(": ");
                text.push_str(d);
            }
        }
        text
    }
}

impl std::fmt::Display for ProblemKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.base_text())
    }
}

/// Engine-level errors raised outside of item state (connection setup, data
/// connections, disk dispatch, configuration). Item-level trouble is carried
/// by `ProblemKind` on the item instead.
#[derive(Debug, Clone)]
pub enum EngineError {
    /// Host name did not resolve to any address.
    NoAddress(String),
    ConnectFailed(String, String),
    ConnectTimeout(String),
    /// The control connection closed; the flag distinguishes a reply timeout.
    ConnectionClosed { timed_out: bool },
    /// Server reply did not look like an FTP reply at all.
    MalformedReply(String),
    /// Non-success final reply to a command that must succeed during login.
    LoginRejected(String),
    /// Proxy/login script references a variable nobody supplied.
    ScriptVariableMissing(String),
    ScriptSyntax(String),
    PassiveReplyUnparsable(String),
    ListenFailed(String),
    DataConnectTimeout,
    DataStartTimeout,
    DiskThreadGone,
    /// Work was cancelled before or while the disk thread ran it.
    DiskCancelled,
    OperationClosed,
    InvalidServerRecord(String),
    ConfigError(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        use EngineError::*;
        match self {
            NoAddress(host) => write!(f, "unable to resolve address: {}", host),
            ConnectFailed(addr, msg) => write!(f, "connect to {} failed: {}", addr, msg),
            ConnectTimeout(addr) => write!(f, "connect to {} timed out", addr),
            ConnectionClosed { timed_out: true } => {
                write!(f, "control connection timed out waiting for a reply")
            }
            ConnectionClosed { timed_out: false } => write!(f, "control connection closed"),
            MalformedReply(line) => write!(f, "malformed server reply: {}", line),
            LoginRejected(reply) => write!(f, "login rejected by server: {}", reply),
            ScriptVariableMissing(name) => {
                write!(f, "login script variable '{}' has no value", name)
            }
            ScriptSyntax(line) => write!(f, "invalid login script line: {}", line),
            PassiveReplyUnparsable(reply) => write!(f, "unable to parse PASV reply: {}", reply),
            ListenFailed(msg) => write!(f, "unable to open a listen socket: {}", msg),
            DataConnectTimeout => write!(f, "data connection was not established in time"),
            DataStartTimeout => write!(f, "data transfer did not start in time"),
            DiskThreadGone => write!(f, "disk thread is no longer running"),
            DiskCancelled => write!(f, "disk work was cancelled"),
            OperationClosed => write!(f, "operation is closed"),
            InvalidServerRecord(alias) => write!(f, "server record '{}' is invalid", alias),
            ConfigError(msg) => write!(f, "configuration error: {}", msg),
        }
    }
}

impl std::error::Error for EngineError {}

impl EngineError {
    /// Whether this error should trigger a reconnect attempt rather than a
    /// permanent connection-error state. Conservative defaults: transport
    /// failures reconnect, login/script/config failures do not.
    pub fn is_retriable_connect(&self) -> bool {
        use EngineError::*;
        match self {
            NoAddress(_) | ConnectFailed(_, _) | ConnectTimeout(_) | ConnectionClosed { .. } => {
                true
            }
            LoginRejected(_)
            | ScriptVariableMissing(_)
            | ScriptSyntax(_)
            | InvalidServerRecord(_)
            | ConfigError(_) => false,
            _ => false,
        }
    }

    /// Whether an error observed mid-transfer warrants returning the item to
    /// the queue and rebuilding the connection (the item goes back to
    /// `waiting` and any worker may pick it up).
    pub fn is_retriable_during_transfer(&self) -> bool {
        use EngineError::*;
        matches!(
            self,
            ConnectionClosed { .. } | DataConnectTimeout | DataStartTimeout | ListenFailed(_)
        )
    }
}

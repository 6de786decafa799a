//! Compute error taxonomy
//!
//! Low-level failures are translated into [`ComputeError`] right where the backend
//! call happens. Registries log them and hand back `None`/`false`; nothing here
//! crosses a registry boundary as a `Result`.

use std::fmt;

/// Numeric device API error codes with their symbolic names.
///
/// Values follow the classic compute API numbering so logs stay greppable
/// across backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ApiErrorCode {
    DeviceNotFound = -1,
    DeviceNotAvailable = -2,
    CompilerNotAvailable = -3,
    MemObjectAllocationFailure = -4,
    OutOfResources = -5,
    OutOfHostMemory = -6,
    MemCopyOverlap = -8,
    ImageFormatNotSupported = -10,
    BuildProgramFailure = -11,
    MapFailure = -12,
    InvalidValue = -30,
    InvalidDeviceType = -31,
    InvalidPlatform = -32,
    InvalidDevice = -33,
    InvalidContext = -34,
    InvalidCommandQueue = -36,
    InvalidMemObject = -38,
    InvalidImageSize = -40,
    InvalidBinary = -42,
    InvalidBuildOptions = -43,
    InvalidProgram = -44,
    InvalidKernelName = -46,
    InvalidKernel = -48,
    InvalidArgIndex = -49,
    InvalidArgValue = -50,
    InvalidArgSize = -51,
    InvalidKernelArgs = -52,
    InvalidWorkDimension = -53,
    InvalidWorkGroupSize = -54,
    InvalidGlobalOffset = -56,
    InvalidOperation = -59,
    InvalidGlObject = -60,
    InvalidBufferSize = -61,
    InvalidGlobalWorkSize = -63,
}

impl ApiErrorCode {
    /// Numeric value of the code.
    #[must_use]
    pub const fn code(self) -> i32 {
        self as i32
    }

    /// Symbolic name of the code.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::DeviceNotFound => "DEVICE_NOT_FOUND",
            Self::DeviceNotAvailable => "DEVICE_NOT_AVAILABLE",
            Self::CompilerNotAvailable => "COMPILER_NOT_AVAILABLE",
            Self::MemObjectAllocationFailure => "MEM_OBJECT_ALLOCATION_FAILURE",
            Self::OutOfResources => "OUT_OF_RESOURCES",
            Self::OutOfHostMemory => "OUT_OF_HOST_MEMORY",
            Self::MemCopyOverlap => "MEM_COPY_OVERLAP",
            Self::ImageFormatNotSupported => "IMAGE_FORMAT_NOT_SUPPORTED",
            Self::BuildProgramFailure => "BUILD_PROGRAM_FAILURE",
            Self::MapFailure => "MAP_FAILURE",
            Self::InvalidValue => "INVALID_VALUE",
            Self::InvalidDeviceType => "INVALID_DEVICE_TYPE",
            Self::InvalidPlatform => "INVALID_PLATFORM",
            Self::InvalidDevice => "INVALID_DEVICE",
            Self::InvalidContext => "INVALID_CONTEXT",
            Self::InvalidCommandQueue => "INVALID_COMMAND_QUEUE",
            Self::InvalidMemObject => "INVALID_MEM_OBJECT",
            Self::InvalidImageSize => "INVALID_IMAGE_SIZE",
            Self::InvalidBinary => "INVALID_BINARY",
            Self::InvalidBuildOptions => "INVALID_BUILD_OPTIONS",
            Self::InvalidProgram => "INVALID_PROGRAM",
            Self::InvalidKernelName => "INVALID_KERNEL_NAME",
            Self::InvalidKernel => "INVALID_KERNEL",
            Self::InvalidArgIndex => "INVALID_ARG_INDEX",
            Self::InvalidArgValue => "INVALID_ARG_VALUE",
            Self::InvalidArgSize => "INVALID_ARG_SIZE",
            Self::InvalidKernelArgs => "INVALID_KERNEL_ARGS",
            Self::InvalidWorkDimension => "INVALID_WORK_DIMENSION",
            Self::InvalidWorkGroupSize => "INVALID_WORK_GROUP_SIZE",
            Self::InvalidGlobalOffset => "INVALID_GLOBAL_OFFSET",
            Self::InvalidOperation => "INVALID_OPERATION",
            Self::InvalidGlObject => "INVALID_GL_OBJECT",
            Self::InvalidBufferSize => "INVALID_BUFFER_SIZE",
            Self::InvalidGlobalWorkSize => "INVALID_GLOBAL_WORK_SIZE",
        }
    }
}

impl fmt::Display for ApiErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code(), self.name())
    }
}

/// Errors raised by the compute layer.
#[derive(Debug, Clone, PartialEq)]
pub enum ComputeError {
    /// No compute devices were found
    DeviceEnumeration(String),
    /// Kernel source failed to parse, validate or build
    Compilation { identifier: String, log: String },
    /// Invalid argument index or incompatible argument type
    ArgumentBinding {
        kernel: String,
        index: u32,
        reason: String,
    },
    /// Requested size exceeds device limits
    Allocation { requested: u64, limit: u64 },
    /// A device API call failed
    Api { code: ApiErrorCode, message: String },
    /// A handle did not resolve to a live object
    InvalidHandle(&'static str),
    /// Kernel exists but cannot be dispatched in its current state
    NotDispatchable { kernel: String, reason: String },
}

impl ComputeError {
    /// Create an API error from a code and message.
    pub fn api(code: ApiErrorCode, message: impl Into<String>) -> Self {
        Self::Api {
            code,
            message: message.into(),
        }
    }

    /// The numeric code this error maps to.
    #[must_use]
    pub fn code(&self) -> ApiErrorCode {
        match self {
            Self::DeviceEnumeration(_) => ApiErrorCode::DeviceNotFound,
            Self::Compilation { .. } => ApiErrorCode::BuildProgramFailure,
            Self::ArgumentBinding { .. } => ApiErrorCode::InvalidArgValue,
            Self::Allocation { .. } => ApiErrorCode::InvalidBufferSize,
            Self::Api { code, .. } => *code,
            Self::InvalidHandle(_) => ApiErrorCode::InvalidMemObject,
            Self::NotDispatchable { .. } => ApiErrorCode::InvalidKernelArgs,
        }
    }
}

impl fmt::Display for ComputeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DeviceEnumeration(e) => write!(f, "Device enumeration error: {e}"),
            Self::Compilation { identifier, log } => {
                write!(f, "Compilation error in \"{identifier}\":\n{log}")
            }
            Self::ArgumentBinding {
                kernel,
                index,
                reason,
            } => write!(
                f,
                "Argument binding error: kernel \"{kernel}\" arg #{index}: {reason}"
            ),
            Self::Allocation { requested, limit } => write!(
                f,
                "Allocation error: requested {requested} bytes, device limit is {limit}"
            ),
            Self::Api { code, message } => write!(f, "{message} ({code})"),
            Self::InvalidHandle(what) => write!(f, "Invalid {what} handle"),
            Self::NotDispatchable { kernel, reason } => {
                write!(f, "Kernel \"{kernel}\" is not dispatchable: {reason}")
            }
        }
    }
}

impl std::error::Error for ComputeError {}

/// Result alias for backend calls.
pub type ComputeResult<T> = Result<T, ComputeError>;

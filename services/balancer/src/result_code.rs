//! Numeric result codes reported to clients and written to logs.

use std::fmt;

use serde::{Serialize, Serializer};

/// Outcome code carried in the diagnostic response body (`statusCode`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResultCode {
    Ok,
    ErrProxy,
    ErrClientProxy,
    ErrEmptyValue,
    ErrCantFindFile,
    ErrCantFindActivePeers,
    ErrPeerIsFailed,
    ErrCantMarshalJson,
    ErrSendResponseToClient,
    ErrCopyDataPeerToClient,
    ErrCopyDataClientToPeer,
    ErrGotPanic,
    StatusBadRequest,
    StatusInternalServerError,
    StatusNotExtended,
    Unknown,
}

impl ResultCode {
    /// Wire value of the code.
    pub fn as_u32(self) -> u32 {
        match self {
            ResultCode::Ok => 0,
            ResultCode::ErrProxy => 1,
            ResultCode::ErrClientProxy => 2,
            ResultCode::ErrEmptyValue => 3,
            ResultCode::ErrCantFindFile => 4,
            ResultCode::ErrCantFindActivePeers => 5,
            ResultCode::ErrPeerIsFailed => 6,
            ResultCode::ErrCantMarshalJson => 7,
            ResultCode::ErrSendResponseToClient => 8,
            ResultCode::ErrCopyDataPeerToClient => 9,
            ResultCode::ErrCopyDataClientToPeer => 10,
            ResultCode::ErrGotPanic => 11,
            ResultCode::StatusBadRequest => 400,
            ResultCode::StatusInternalServerError => 500,
            ResultCode::StatusNotExtended => 510,
            ResultCode::Unknown => 0xFFFF_FFFF,
        }
    }

    /// Human readable description.
    pub fn as_str(self) -> &'static str {
        match self {
            ResultCode::Ok => "SUCCESS",
            ResultCode::ErrProxy => "proxy error",
            ResultCode::ErrClientProxy => "proxy client error",
            ResultCode::ErrEmptyValue => "value is empty",
            ResultCode::ErrCantFindFile => "can't find file",
            ResultCode::ErrCantFindActivePeers => "can't find active peers",
            ResultCode::ErrPeerIsFailed => "peer is failed",
            ResultCode::ErrCantMarshalJson => "can't marshal json object",
            ResultCode::ErrSendResponseToClient => "proxy err send response to client",
            ResultCode::ErrCopyDataPeerToClient => "error copy data from peer to client",
            ResultCode::ErrCopyDataClientToPeer => "error copy data from client to peer",
            ResultCode::ErrGotPanic => "got panic",
            ResultCode::StatusBadRequest => "status bad request",
            ResultCode::StatusInternalServerError => "status internal server error",
            ResultCode::StatusNotExtended => "status not extended",
            ResultCode::Unknown => "unknown error",
        }
    }

    /// Describe a raw wire value, including ones this build does not know.
    pub fn describe(value: u32) -> String {
        match Self::from_u32(value) {
            Some(code) => code.as_str().to_string(),
            None => format!("unknown result code: {value}"),
        }
    }

    /// Parse a wire value.
    pub fn from_u32(value: u32) -> Option<Self> {
        const ALL: [ResultCode; 16] = [
            ResultCode::Ok,
            ResultCode::ErrProxy,
            ResultCode::ErrClientProxy,
            ResultCode::ErrEmptyValue,
            ResultCode::ErrCantFindFile,
            ResultCode::ErrCantFindActivePeers,
            ResultCode::ErrPeerIsFailed,
            ResultCode::ErrCantMarshalJson,
            ResultCode::ErrSendResponseToClient,
            ResultCode::ErrCopyDataPeerToClient,
            ResultCode::ErrCopyDataClientToPeer,
            ResultCode::ErrGotPanic,
            ResultCode::StatusBadRequest,
            ResultCode::StatusInternalServerError,
            ResultCode::StatusNotExtended,
            ResultCode::Unknown,
        ];

        ALL.into_iter().find(|code| code.as_u32() == value)
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for ResultCode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u32(self.as_u32())
    }
}

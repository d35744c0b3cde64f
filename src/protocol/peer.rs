//! Peer messages exchanged on "P" connections after the init message.

use bytes::{BufMut, Bytes, BytesMut};

use super::error::ProtocolError;
use super::frame::{decode_frame, frame, CodeWidth, Decoded, RawFrame};
use super::wire::{compress, decompress, Reader, TextEncoding, WireWrite};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum PeerCode {
    GetSharedFileList = 4,
    SharedFileList = 5,
    FileSearchResponse = 9,
    UserInfoRequest = 15,
    UserInfoResponse = 16,
    FolderContentsRequest = 36,
    FolderContentsResponse = 37,
    TransferRequest = 40,
    TransferResponse = 41,
    QueueUpload = 43,
    PlaceInQueueResponse = 44,
    UploadFailed = 46,
    UploadDenied = 50,
    PlaceInQueueRequest = 51,
    UploadQueueNotification = 52,
}

impl TryFrom<u32> for PeerCode {
    type Error = ProtocolError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            4 => Ok(PeerCode::GetSharedFileList),
            5 => Ok(PeerCode::SharedFileList),
            9 => Ok(PeerCode::FileSearchResponse),
            15 => Ok(PeerCode::UserInfoRequest),
            16 => Ok(PeerCode::UserInfoResponse),
            36 => Ok(PeerCode::FolderContentsRequest),
            37 => Ok(PeerCode::FolderContentsResponse),
            40 => Ok(PeerCode::TransferRequest),
            41 => Ok(PeerCode::TransferResponse),
            43 => Ok(PeerCode::QueueUpload),
            44 => Ok(PeerCode::PlaceInQueueResponse),
            46 => Ok(PeerCode::UploadFailed),
            50 => Ok(PeerCode::UploadDenied),
            51 => Ok(PeerCode::PlaceInQueueRequest),
            52 => Ok(PeerCode::UploadQueueNotification),
            _ => Err(ProtocolError::InvalidValue(format!("peer code {}", value))),
        }
    }
}

/// Direction field of a TransferRequest, from the sender's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferDirection {
    Download = 0,
    Upload = 1,
}

impl TryFrom<u32> for TransferDirection {
    type Error = ProtocolError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(TransferDirection::Download),
            1 => Ok(TransferDirection::Upload),
            _ => Err(ProtocolError::InvalidValue(format!("transfer direction {}", value))),
        }
    }
}

/// A numbered file attribute (bitrate, duration, VBR flag, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileAttribute {
    pub kind: u32,
    pub value: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SharedFile {
    pub code: u8,
    pub name: String,
    pub size: u64,
    pub extension: String,
    pub attributes: Vec<FileAttribute>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SharedDirectory {
    pub name: String,
    pub files: Vec<SharedFile>,
}

/// One requested folder and the directories below it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FolderContents {
    pub folder: String,
    pub directories: Vec<SharedDirectory>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferReply {
    /// The size is only present when answering an upload request.
    Allowed { size: Option<u64> },
    Denied { reason: Option<String> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerMessage {
    GetSharedFileList,
    SharedFileList {
        directories: Vec<SharedDirectory>,
        private_directories: Vec<SharedDirectory>,
    },
    FileSearchResponse {
        user: String,
        token: u32,
        results: Vec<SharedFile>,
        free_slots: bool,
        upload_speed: u32,
        queue_length: u32,
        private_results: Vec<SharedFile>,
    },
    UserInfoRequest,
    UserInfoResponse {
        description: String,
        picture: Option<Bytes>,
        total_uploads: u32,
        queue_size: u32,
        slots_free: bool,
        upload_permitted: Option<u32>,
    },
    FolderContentsRequest { token: u32, folder: String },
    FolderContentsResponse { folders: Vec<FolderContents> },
    TransferRequest {
        direction: TransferDirection,
        token: u32,
        file: String,
        size: Option<u64>,
    },
    TransferResponse { token: u32, reply: TransferReply },
    QueueUpload { file: String },
    PlaceInQueueResponse { file: String, place: u32 },
    UploadFailed { file: String },
    UploadDenied { file: String, reason: String },
    PlaceInQueueRequest { file: String },
    UploadQueueNotification,
}

fn write_file(buf: &mut BytesMut, file: &SharedFile) {
    buf.put_u8(file.code);
    buf.put_string(&file.name);
    buf.put_u64_le(file.size);
    buf.put_string(&file.extension);
    buf.put_u32_le(file.attributes.len() as u32);
    for attribute in &file.attributes {
        buf.put_u32_le(attribute.kind);
        buf.put_u32_le(attribute.value);
    }
}

fn read_file(r: &mut Reader<'_>) -> Result<SharedFile, ProtocolError> {
    let code = r.u8()?;
    let name = r.string()?;
    let size = r.file_size()?;
    let extension = r.string()?;
    let count = r.u32()? as usize;
    let mut attributes = Vec::with_capacity(count.min(r.remaining() / 8));
    for _ in 0..count {
        attributes.push(FileAttribute {
            kind: r.u32()?,
            value: r.u32()?,
        });
    }
    Ok(SharedFile {
        code,
        name,
        size,
        extension,
        attributes,
    })
}

fn write_files(buf: &mut BytesMut, files: &[SharedFile]) {
    buf.put_u32_le(files.len() as u32);
    for file in files {
        write_file(buf, file);
    }
}

fn read_files(r: &mut Reader<'_>) -> Result<Vec<SharedFile>, ProtocolError> {
    let count = r.u32()? as usize;
    let mut files = Vec::with_capacity(count.min(r.remaining() / 21));
    for _ in 0..count {
        files.push(read_file(r)?);
    }
    Ok(files)
}

fn write_directories(buf: &mut BytesMut, directories: &[SharedDirectory]) {
    buf.put_u32_le(directories.len() as u32);
    for directory in directories {
        buf.put_string(&directory.name);
        write_files(buf, &directory.files);
    }
}

fn read_directories(r: &mut Reader<'_>) -> Result<Vec<SharedDirectory>, ProtocolError> {
    let count = r.u32()? as usize;
    let mut directories = Vec::with_capacity(count.min(r.remaining() / 8));
    for _ in 0..count {
        directories.push(SharedDirectory {
            name: r.string()?,
            files: read_files(r)?,
        });
    }
    Ok(directories)
}

impl PeerMessage {
    pub fn code(&self) -> PeerCode {
        match self {
            PeerMessage::GetSharedFileList => PeerCode::GetSharedFileList,
            PeerMessage::SharedFileList { .. } => PeerCode::SharedFileList,
            PeerMessage::FileSearchResponse { .. } => PeerCode::FileSearchResponse,
            PeerMessage::UserInfoRequest => PeerCode::UserInfoRequest,
            PeerMessage::UserInfoResponse { .. } => PeerCode::UserInfoResponse,
            PeerMessage::FolderContentsRequest { .. } => PeerCode::FolderContentsRequest,
            PeerMessage::FolderContentsResponse { .. } => PeerCode::FolderContentsResponse,
            PeerMessage::TransferRequest { .. } => PeerCode::TransferRequest,
            PeerMessage::TransferResponse { .. } => PeerCode::TransferResponse,
            PeerMessage::QueueUpload { .. } => PeerCode::QueueUpload,
            PeerMessage::PlaceInQueueResponse { .. } => PeerCode::PlaceInQueueResponse,
            PeerMessage::UploadFailed { .. } => PeerCode::UploadFailed,
            PeerMessage::UploadDenied { .. } => PeerCode::UploadDenied,
            PeerMessage::PlaceInQueueRequest { .. } => PeerCode::PlaceInQueueRequest,
            PeerMessage::UploadQueueNotification => PeerCode::UploadQueueNotification,
        }
    }

    /// The virtual path a transfer-related message refers to, if any.
    pub fn file(&self) -> Option<&str> {
        match self {
            PeerMessage::TransferRequest { file, .. }
            | PeerMessage::QueueUpload { file }
            | PeerMessage::PlaceInQueueResponse { file, .. }
            | PeerMessage::UploadFailed { file }
            | PeerMessage::UploadDenied { file, .. }
            | PeerMessage::PlaceInQueueRequest { file } => Some(file),
            _ => None,
        }
    }

    pub fn encode(&self) -> Result<Bytes, ProtocolError> {
        self.encode_with(TextEncoding::Utf8)
    }

    /// Encodes with file paths written in `encoding`.
    pub fn encode_with(&self, encoding: TextEncoding) -> Result<Bytes, ProtocolError> {
        let mut buf = BytesMut::new();

        match self {
            PeerMessage::GetSharedFileList
            | PeerMessage::UserInfoRequest
            | PeerMessage::UploadQueueNotification => {}
            PeerMessage::SharedFileList {
                directories,
                private_directories,
            } => {
                let mut inner = BytesMut::new();
                write_directories(&mut inner, directories);
                inner.put_u32_le(0);
                if !private_directories.is_empty() {
                    write_directories(&mut inner, private_directories);
                }
                buf.put_slice(&compress(&inner)?);
            }
            PeerMessage::FileSearchResponse {
                user,
                token,
                results,
                free_slots,
                upload_speed,
                queue_length,
                private_results,
            } => {
                let mut inner = BytesMut::new();
                inner.put_string(user);
                inner.put_u32_le(*token);
                write_files(&mut inner, results);
                inner.put_flag(*free_slots);
                inner.put_u32_le(*upload_speed);
                inner.put_u32_le(*queue_length);
                inner.put_u32_le(0);
                if !private_results.is_empty() {
                    write_files(&mut inner, private_results);
                }
                buf.put_slice(&compress(&inner)?);
            }
            PeerMessage::UserInfoResponse {
                description,
                picture,
                total_uploads,
                queue_size,
                slots_free,
                upload_permitted,
            } => {
                buf.put_string(description);
                buf.put_flag(picture.is_some());
                if let Some(picture) = picture {
                    buf.put_prefixed(picture);
                }
                buf.put_u32_le(*total_uploads);
                buf.put_u32_le(*queue_size);
                buf.put_flag(*slots_free);
                if let Some(permitted) = upload_permitted {
                    buf.put_u32_le(*permitted);
                }
            }
            PeerMessage::FolderContentsRequest { token, folder } => {
                buf.put_u32_le(*token);
                buf.put_string_with(folder, TextEncoding::Latin1);
            }
            PeerMessage::FolderContentsResponse { folders } => {
                let mut inner = BytesMut::new();
                inner.put_u32_le(folders.len() as u32);
                for contents in folders {
                    inner.put_string(&contents.folder);
                    write_directories(&mut inner, &contents.directories);
                }
                buf.put_slice(&compress(&inner)?);
            }
            PeerMessage::TransferRequest {
                direction,
                token,
                file,
                size,
            } => {
                buf.put_u32_le(*direction as u32);
                buf.put_u32_le(*token);
                buf.put_string_with(file, encoding);
                if let Some(size) = size {
                    buf.put_u64_le(*size);
                }
            }
            PeerMessage::TransferResponse { token, reply } => {
                buf.put_u32_le(*token);
                match reply {
                    TransferReply::Allowed { size } => {
                        buf.put_flag(true);
                        if let Some(size) = size {
                            buf.put_u64_le(*size);
                        }
                    }
                    TransferReply::Denied { reason } => {
                        buf.put_flag(false);
                        if let Some(reason) = reason {
                            buf.put_string(reason);
                        }
                    }
                }
            }
            PeerMessage::QueueUpload { file }
            | PeerMessage::UploadFailed { file }
            | PeerMessage::PlaceInQueueRequest { file } => {
                buf.put_string_with(file, encoding);
            }
            PeerMessage::PlaceInQueueResponse { file, place } => {
                buf.put_string_with(file, encoding);
                buf.put_u32_le(*place);
            }
            PeerMessage::UploadDenied { file, reason } => {
                buf.put_string_with(file, encoding);
                buf.put_string(reason);
            }
        }

        Ok(frame(CodeWidth::U32, self.code() as u32, &buf))
    }

    pub fn decode(buf: &[u8]) -> Result<Decoded<Self>, ProtocolError> {
        decode_frame(buf, CodeWidth::U32, Self::decode_raw)
    }

    fn decode_raw(raw: &RawFrame<'_>) -> Result<Decoded<Self>, ProtocolError> {
        let Ok(code) = PeerCode::try_from(raw.code) else {
            return Ok(Decoded::Unsupported {
                code: raw.code,
                consumed: raw.consumed,
            });
        };

        let message = Self::decode_payload(code, raw.payload)?;
        Ok(Decoded::Message(message, raw.consumed))
    }

    fn decode_payload(code: PeerCode, payload: &[u8]) -> Result<Self, ProtocolError> {
        let mut r = Reader::new(payload);

        let message = match code {
            PeerCode::GetSharedFileList => PeerMessage::GetSharedFileList,
            PeerCode::SharedFileList => {
                let inflated = decompress(payload)?;
                let mut r = Reader::new(&inflated);
                let directories = read_directories(&mut r)?;
                if !r.is_empty() {
                    let _unknown = r.u32()?;
                }
                let private_directories = if r.is_empty() {
                    Vec::new()
                } else {
                    read_directories(&mut r)?
                };
                PeerMessage::SharedFileList {
                    directories,
                    private_directories,
                }
            }
            PeerCode::FileSearchResponse => {
                let inflated = decompress(payload)?;
                let mut r = Reader::new(&inflated);
                let user = r.string()?;
                let token = r.u32()?;
                let results = read_files(&mut r)?;
                let free_slots = r.bool()?;
                let upload_speed = r.u32()?;
                let queue_length = r.u32()?;
                if !r.is_empty() {
                    let _unknown = r.u32()?;
                }
                let private_results = if r.is_empty() {
                    Vec::new()
                } else {
                    read_files(&mut r)?
                };
                PeerMessage::FileSearchResponse {
                    user,
                    token,
                    results,
                    free_slots,
                    upload_speed,
                    queue_length,
                    private_results,
                }
            }
            PeerCode::UserInfoRequest => PeerMessage::UserInfoRequest,
            PeerCode::UserInfoResponse => {
                let description = r.string()?;
                let picture = if r.bool()? { Some(r.bytes()?) } else { None };
                let total_uploads = r.u32()?;
                let queue_size = r.u32()?;
                let slots_free = r.bool()?;
                // Museek+ sends slots_free as a u32, leaving 3 stray bytes
                let upload_permitted = if r.remaining() >= 4 { Some(r.u32()?) } else { None };
                PeerMessage::UserInfoResponse {
                    description,
                    picture,
                    total_uploads,
                    queue_size,
                    slots_free,
                    upload_permitted,
                }
            }
            PeerCode::FolderContentsRequest => PeerMessage::FolderContentsRequest {
                token: r.u32()?,
                folder: r.string()?,
            },
            PeerCode::FolderContentsResponse => {
                let inflated = decompress(payload)?;
                let mut r = Reader::new(&inflated);
                let count = r.u32()? as usize;
                let mut folders = Vec::with_capacity(count.min(r.remaining() / 8));
                for _ in 0..count {
                    folders.push(FolderContents {
                        folder: r.string()?,
                        directories: read_directories(&mut r)?,
                    });
                }
                PeerMessage::FolderContentsResponse { folders }
            }
            PeerCode::TransferRequest => {
                let direction = TransferDirection::try_from(r.u32()?)?;
                let token = r.u32()?;
                let file = r.string()?;
                let size = if r.remaining() >= 8 { Some(r.file_size()?) } else { None };
                PeerMessage::TransferRequest {
                    direction,
                    token,
                    file,
                    size,
                }
            }
            PeerCode::TransferResponse => {
                let token = r.u32()?;
                let reply = if r.bool()? {
                    TransferReply::Allowed {
                        size: if r.remaining() >= 8 { Some(r.u64()?) } else { None },
                    }
                } else {
                    TransferReply::Denied {
                        reason: if r.is_empty() { None } else { Some(r.string()?) },
                    }
                };
                PeerMessage::TransferResponse { token, reply }
            }
            PeerCode::QueueUpload => PeerMessage::QueueUpload { file: r.string()? },
            PeerCode::PlaceInQueueResponse => PeerMessage::PlaceInQueueResponse {
                file: r.string()?,
                place: r.u32()?,
            },
            PeerCode::UploadFailed => PeerMessage::UploadFailed { file: r.string()? },
            PeerCode::UploadDenied => PeerMessage::UploadDenied {
                file: r.string()?,
                reason: r.string()?,
            },
            PeerCode::PlaceInQueueRequest => PeerMessage::PlaceInQueueRequest { file: r.string()? },
            PeerCode::UploadQueueNotification => PeerMessage::UploadQueueNotification,
        };

        Ok(message)
    }
}

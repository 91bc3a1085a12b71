use std::io;

use crate::{
    ByteReader, Deserialize, Serialize,
    deserialize::from_bytes,
    proto::{PullRequest, PushNotify, TensorMap},
    serialize::serialize_nested,
};

type Header = u32;

/// The type tag of a `DistMessage`.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MsgKind {
    EchoRequest = 1,
    EchoResponse = 2,
    HeartBeatNotify = 3,
    FileRequest = 11,
    FileResponse = 12,
    FileFinishNotify = 13,
    PullRequest = 14,
    PullResponse = 15,
    PushNotify = 16,
    ModelSaveRequest = 17,
    ModelSaveResponse = 18,
    TerminationNotify = 19,
    UserRequest = 31,
    UserResponse = 32,
    UserNotify = 33,
}

impl MsgKind {
    /// Returns `true` if a message of this kind must be answered on the same connection.
    pub fn has_response(self) -> bool {
        matches!(
            self,
            MsgKind::EchoRequest
                | MsgKind::FileRequest
                | MsgKind::PullRequest
                | MsgKind::ModelSaveRequest
                | MsgKind::UserRequest
        )
    }

    /// Returns the kind of the message answering this one, if any.
    pub fn response(self) -> Option<MsgKind> {
        match self {
            MsgKind::EchoRequest => Some(MsgKind::EchoResponse),
            MsgKind::FileRequest => Some(MsgKind::FileResponse),
            MsgKind::PullRequest => Some(MsgKind::PullResponse),
            MsgKind::ModelSaveRequest => Some(MsgKind::ModelSaveResponse),
            MsgKind::UserRequest => Some(MsgKind::UserResponse),
            _ => None,
        }
    }
}

impl TryFrom<Header> for MsgKind {
    type Error = io::Error;

    fn try_from(value: Header) -> io::Result<Self> {
        let kind = match value {
            1 => MsgKind::EchoRequest,
            2 => MsgKind::EchoResponse,
            3 => MsgKind::HeartBeatNotify,
            11 => MsgKind::FileRequest,
            12 => MsgKind::FileResponse,
            13 => MsgKind::FileFinishNotify,
            14 => MsgKind::PullRequest,
            15 => MsgKind::PullResponse,
            16 => MsgKind::PushNotify,
            17 => MsgKind::ModelSaveRequest,
            18 => MsgKind::ModelSaveResponse,
            19 => MsgKind::TerminationNotify,
            31 => MsgKind::UserRequest,
            32 => MsgKind::UserResponse,
            33 => MsgKind::UserNotify,
            kind => return invalid_kind(kind),
        };

        Ok(kind)
    }
}

fn invalid_kind<T>(kind: Header) -> io::Result<T> {
    Err(io::Error::new(
        io::ErrorKind::InvalidData,
        format!("received an invalid message kind {kind}"),
    ))
}

/// An encoded nested payload that is only decoded when asked for.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Payload<'a>(&'a [u8]);

impl<'a> Payload<'a> {
    /// Returns the raw encoded bytes.
    pub fn as_bytes(&self) -> &'a [u8] {
        self.0
    }

    /// Decodes the payload, the whole payload must be consumed.
    pub fn decode<T: Deserialize<'a>>(&self) -> io::Result<T> {
        from_bytes(self.0)
    }
}

/// The application layer message, owning form.
///
/// Used to build requests and responses.
#[derive(Debug, Clone, PartialEq)]
pub enum DistMessage {
    EchoRequest,
    EchoResponse,
    HeartBeatNotify,
    FileRequest,
    /// An empty `file` means there is no file available right now.
    FileResponse {
        epoch: u32,
        file: String,
    },
    FileFinishNotify {
        file: String,
        loss: f64,
        loss_weight: f64,
    },
    PullRequest(PullRequest),
    PullResponse(TensorMap),
    PushNotify(PushNotify),
    ModelSaveRequest {
        epoch: u32,
        timestamp: String,
    },
    ModelSaveResponse {
        saved: bool,
        path: String,
    },
    TerminationNotify,
    UserRequest(Vec<u8>),
    UserResponse(Vec<u8>),
    UserNotify(Vec<u8>),
}

/// The application layer message, borrowed form.
///
/// Strings and byte payloads alias the receive buffer, the heavy payloads
/// are kept encoded until `Payload::decode` is called.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DistMessageView<'a> {
    EchoRequest,
    EchoResponse,
    HeartBeatNotify,
    FileRequest,
    FileResponse {
        epoch: u32,
        file: &'a str,
    },
    FileFinishNotify {
        file: &'a str,
        loss: f64,
        loss_weight: f64,
    },
    PullRequest(Payload<'a>),
    PullResponse(Payload<'a>),
    PushNotify(Payload<'a>),
    ModelSaveRequest {
        epoch: u32,
        timestamp: &'a str,
    },
    ModelSaveResponse {
        saved: bool,
        path: &'a str,
    },
    TerminationNotify,
    UserRequest(&'a [u8]),
    UserResponse(&'a [u8]),
    UserNotify(&'a [u8]),
}

impl DistMessage {
    /// Returns the type tag of this message.
    pub fn kind(&self) -> MsgKind {
        match self {
            DistMessage::EchoRequest => MsgKind::EchoRequest,
            DistMessage::EchoResponse => MsgKind::EchoResponse,
            DistMessage::HeartBeatNotify => MsgKind::HeartBeatNotify,
            DistMessage::FileRequest => MsgKind::FileRequest,
            DistMessage::FileResponse { .. } => MsgKind::FileResponse,
            DistMessage::FileFinishNotify { .. } => MsgKind::FileFinishNotify,
            DistMessage::PullRequest(_) => MsgKind::PullRequest,
            DistMessage::PullResponse(_) => MsgKind::PullResponse,
            DistMessage::PushNotify(_) => MsgKind::PushNotify,
            DistMessage::ModelSaveRequest { .. } => MsgKind::ModelSaveRequest,
            DistMessage::ModelSaveResponse { .. } => MsgKind::ModelSaveResponse,
            DistMessage::TerminationNotify => MsgKind::TerminationNotify,
            DistMessage::UserRequest(_) => MsgKind::UserRequest,
            DistMessage::UserResponse(_) => MsgKind::UserResponse,
            DistMessage::UserNotify(_) => MsgKind::UserNotify,
        }
    }
}

impl<'a> DistMessageView<'a> {
    /// Returns the type tag of this message.
    pub fn kind(&self) -> MsgKind {
        match self {
            DistMessageView::EchoRequest => MsgKind::EchoRequest,
            DistMessageView::EchoResponse => MsgKind::EchoResponse,
            DistMessageView::HeartBeatNotify => MsgKind::HeartBeatNotify,
            DistMessageView::FileRequest => MsgKind::FileRequest,
            DistMessageView::FileResponse { .. } => MsgKind::FileResponse,
            DistMessageView::FileFinishNotify { .. } => MsgKind::FileFinishNotify,
            DistMessageView::PullRequest(_) => MsgKind::PullRequest,
            DistMessageView::PullResponse(_) => MsgKind::PullResponse,
            DistMessageView::PushNotify(_) => MsgKind::PushNotify,
            DistMessageView::ModelSaveRequest { .. } => MsgKind::ModelSaveRequest,
            DistMessageView::ModelSaveResponse { .. } => MsgKind::ModelSaveResponse,
            DistMessageView::TerminationNotify => MsgKind::TerminationNotify,
            DistMessageView::UserRequest(_) => MsgKind::UserRequest,
            DistMessageView::UserResponse(_) => MsgKind::UserResponse,
            DistMessageView::UserNotify(_) => MsgKind::UserNotify,
        }
    }

    /// Decodes every payload and copies every borrowed field.
    ///
    /// # Returns
    /// The owning form of the message or an error if a nested payload is malformed.
    pub fn to_message(&self) -> io::Result<DistMessage> {
        let msg = match *self {
            DistMessageView::EchoRequest => DistMessage::EchoRequest,
            DistMessageView::EchoResponse => DistMessage::EchoResponse,
            DistMessageView::HeartBeatNotify => DistMessage::HeartBeatNotify,
            DistMessageView::FileRequest => DistMessage::FileRequest,
            DistMessageView::FileResponse { epoch, file } => DistMessage::FileResponse {
                epoch,
                file: file.to_owned(),
            },
            DistMessageView::FileFinishNotify {
                file,
                loss,
                loss_weight,
            } => DistMessage::FileFinishNotify {
                file: file.to_owned(),
                loss,
                loss_weight,
            },
            DistMessageView::PullRequest(payload) => DistMessage::PullRequest(payload.decode()?),
            DistMessageView::PullResponse(payload) => DistMessage::PullResponse(payload.decode()?),
            DistMessageView::PushNotify(payload) => DistMessage::PushNotify(payload.decode()?),
            DistMessageView::ModelSaveRequest { epoch, timestamp } => {
                DistMessage::ModelSaveRequest {
                    epoch,
                    timestamp: timestamp.to_owned(),
                }
            }
            DistMessageView::ModelSaveResponse { saved, path } => DistMessage::ModelSaveResponse {
                saved,
                path: path.to_owned(),
            },
            DistMessageView::TerminationNotify => DistMessage::TerminationNotify,
            DistMessageView::UserRequest(buf) => DistMessage::UserRequest(buf.to_vec()),
            DistMessageView::UserResponse(buf) => DistMessage::UserResponse(buf.to_vec()),
            DistMessageView::UserNotify(buf) => DistMessage::UserNotify(buf.to_vec()),
        };

        Ok(msg)
    }
}

impl Serialize for DistMessage {
    fn serialize(&self, buf: &mut Vec<u8>) {
        (self.kind() as Header).serialize(buf);

        match self {
            DistMessage::EchoRequest
            | DistMessage::EchoResponse
            | DistMessage::HeartBeatNotify
            | DistMessage::FileRequest
            | DistMessage::TerminationNotify => {}
            DistMessage::FileResponse { epoch, file } => {
                epoch.serialize(buf);
                file.serialize(buf);
            }
            DistMessage::FileFinishNotify {
                file,
                loss,
                loss_weight,
            } => {
                file.serialize(buf);
                loss.serialize(buf);
                loss_weight.serialize(buf);
            }
            DistMessage::PullRequest(req) => serialize_nested(buf, |buf| req.serialize(buf)),
            DistMessage::PullResponse(params) => serialize_nested(buf, |buf| params.serialize(buf)),
            DistMessage::PushNotify(push) => serialize_nested(buf, |buf| push.serialize(buf)),
            DistMessage::ModelSaveRequest { epoch, timestamp } => {
                epoch.serialize(buf);
                timestamp.serialize(buf);
            }
            DistMessage::ModelSaveResponse { saved, path } => {
                saved.serialize(buf);
                path.serialize(buf);
            }
            DistMessage::UserRequest(bytes)
            | DistMessage::UserResponse(bytes)
            | DistMessage::UserNotify(bytes) => bytes.serialize(buf),
        }
    }
}

impl<'a> Deserialize<'a> for DistMessageView<'a> {
    fn deserialize(reader: &mut ByteReader<'a>) -> io::Result<Self> {
        let kind = MsgKind::try_from(reader.read::<Header>()?)?;

        let view = match kind {
            MsgKind::EchoRequest => DistMessageView::EchoRequest,
            MsgKind::EchoResponse => DistMessageView::EchoResponse,
            MsgKind::HeartBeatNotify => DistMessageView::HeartBeatNotify,
            MsgKind::FileRequest => DistMessageView::FileRequest,
            MsgKind::FileResponse => DistMessageView::FileResponse {
                epoch: reader.read()?,
                file: reader.read()?,
            },
            MsgKind::FileFinishNotify => DistMessageView::FileFinishNotify {
                file: reader.read()?,
                loss: reader.read()?,
                loss_weight: reader.read()?,
            },
            MsgKind::PullRequest => DistMessageView::PullRequest(Payload(reader.read()?)),
            MsgKind::PullResponse => DistMessageView::PullResponse(Payload(reader.read()?)),
            MsgKind::PushNotify => DistMessageView::PushNotify(Payload(reader.read()?)),
            MsgKind::ModelSaveRequest => DistMessageView::ModelSaveRequest {
                epoch: reader.read()?,
                timestamp: reader.read()?,
            },
            MsgKind::ModelSaveResponse => DistMessageView::ModelSaveResponse {
                saved: reader.read()?,
                path: reader.read()?,
            },
            MsgKind::TerminationNotify => DistMessageView::TerminationNotify,
            MsgKind::UserRequest => DistMessageView::UserRequest(reader.read()?),
            MsgKind::UserResponse => DistMessageView::UserResponse(reader.read()?),
            MsgKind::UserNotify => DistMessageView::UserNotify(reader.read()?),
        };

        Ok(view)
    }
}

impl<'a> Deserialize<'a> for DistMessage {
    fn deserialize(reader: &mut ByteReader<'a>) -> io::Result<Self> {
        reader.read::<DistMessageView>()?.to_message()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;
    use crate::proto::{DenseTensor, SparseRows, Tensor};

    fn encode(msg: &DistMessage) -> Vec<u8> {
        let mut buf = Vec::new();
        msg.serialize(&mut buf);
        buf
    }

    fn sample_tensors() -> TensorMap {
        let mut srm = SparseRows::new(2);
        srm.rows.insert(11, vec![0.25, 0.5]);
        srm.rows.insert(3, vec![-1., 1.]);

        let mut map = TensorMap::new();
        map.insert("emb".into(), Tensor::Sparse(srm));
        map.insert(
            "bias".into(),
            Tensor::Dense(DenseTensor::from_data(vec![3], vec![1., 2., 3.]).unwrap()),
        );
        map
    }

    fn all_messages() -> Vec<DistMessage> {
        let mut req = PullRequest {
            is_train: true,
            tsr_set: BTreeSet::from(["bias".to_string()]),
            ..Default::default()
        };
        req.srm_map.insert("emb".into(), [3, 11, 42].into_iter().collect());
        req.id_freq_map.extend([(3, 1), (11, 7), (42, 2)]);

        vec![
            DistMessage::EchoRequest,
            DistMessage::EchoResponse,
            DistMessage::HeartBeatNotify,
            DistMessage::FileRequest,
            DistMessage::FileResponse {
                epoch: 2,
                file: "part-0001".into(),
            },
            DistMessage::FileFinishNotify {
                file: "part-0001".into(),
                loss: 0.693,
                loss_weight: 128.,
            },
            DistMessage::PullRequest(req),
            DistMessage::PullResponse(sample_tensors()),
            DistMessage::PushNotify(PushNotify {
                grad: sample_tensors(),
                overwritten: TensorMap::new(),
            }),
            DistMessage::ModelSaveRequest {
                epoch: 3,
                timestamp: "20260101".into(),
            },
            DistMessage::ModelSaveResponse {
                saved: true,
                path: "/tmp/model".into(),
            },
            DistMessage::TerminationNotify,
            DistMessage::UserRequest(b"ping".to_vec()),
            DistMessage::UserResponse(Vec::new()),
            DistMessage::UserNotify(vec![0, 1, 2, 255]),
        ]
    }

    #[test]
    fn every_variant_round_trips() {
        for msg in all_messages() {
            let buf = encode(&msg);
            let decoded: DistMessage = from_bytes(&buf).unwrap();
            assert_eq!(decoded, msg);
            assert_eq!(encode(&decoded), buf, "re-encoding {:?} changed bytes", msg.kind());
        }
    }

    #[test]
    fn view_kind_matches_owned_kind() {
        for msg in all_messages() {
            let buf = encode(&msg);
            let view: DistMessageView = from_bytes(&buf).unwrap();
            assert_eq!(view.kind(), msg.kind());
        }
    }

    #[test]
    fn view_payload_decodes_lazily() {
        let msg = DistMessage::PullResponse(sample_tensors());
        let buf = encode(&msg);

        let DistMessageView::PullResponse(payload) = from_bytes(&buf).unwrap() else {
            panic!("expected a pull response");
        };

        let params: TensorMap = payload.decode().unwrap();
        assert_eq!(params, sample_tensors());
    }

    #[test]
    fn tag_is_the_first_field() {
        let buf = encode(&DistMessage::TerminationNotify);
        assert_eq!(buf, 19u32.to_be_bytes());
    }

    #[test]
    fn unknown_kind_is_invalid_data() {
        for kind in [0u32, 4, 20, 34, 1000] {
            let err = from_bytes::<DistMessageView>(&kind.to_be_bytes()).unwrap_err();
            assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        }
    }

    #[test]
    fn corrupted_payload_fails_to_decode() {
        let mut buf = encode(&DistMessage::PullResponse(sample_tensors()));
        let last = buf.len() - 1;
        buf.truncate(last);
        assert!(from_bytes::<DistMessage>(&buf).is_err());
    }

    #[test]
    fn has_response_matches_directionality() {
        let requests = [
            MsgKind::EchoRequest,
            MsgKind::FileRequest,
            MsgKind::PullRequest,
            MsgKind::ModelSaveRequest,
            MsgKind::UserRequest,
        ];

        for msg in all_messages() {
            let kind = msg.kind();
            assert_eq!(kind.has_response(), requests.contains(&kind));
            assert_eq!(kind.response().is_some(), kind.has_response());
        }
    }
}

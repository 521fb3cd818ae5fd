use std::io;

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

use whip_proto::mesh::{MeshMsg, MESSAGE_SIZE};

/// Frames the fixed 38-byte intramesh messages over a query connection.
/// Malformed frames surface as `InvalidData`, which tears the connection
/// down.
pub struct MeshCodec;

impl Decoder for MeshCodec {
    type Item = MeshMsg;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<MeshMsg>, io::Error> {
        if src.len() < MESSAGE_SIZE {
            src.reserve(MESSAGE_SIZE - src.len());
            return Ok(None);
        }
        let frame = src.split_to(MESSAGE_SIZE);
        MeshMsg::parse(&frame)
            .map(Some)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))
    }
}

impl Encoder<MeshMsg> for MeshCodec {
    type Error = io::Error;

    fn encode(&mut self, msg: MeshMsg, dst: &mut BytesMut) -> Result<(), io::Error> {
        dst.extend_from_slice(&msg.encode());
        Ok(())
    }
}

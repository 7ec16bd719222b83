// SPDX-License-Identifier: GPL-3.0-only

use quick_protobuf::{BytesReader, MessageRead, MessageWrite, Writer};

/// Shared scratch buffer for writing runs of zeros. Lives in .bss, so the
/// size costs nothing in the binary.
pub static ZEROS: [u8; 1024 * 1024] = [0u8; 1024 * 1024];

/// Decode a complete protobuf message from a buffer.
pub fn read_protobuf<'a, M: MessageRead<'a>>(data: &'a [u8]) -> quick_protobuf::Result<M> {
    let mut reader = BytesReader::from_bytes(data);
    M::from_reader(&mut reader, data)
}

/// Encode a protobuf message without a length prefix.
pub fn write_protobuf<M: MessageWrite>(message: &M) -> quick_protobuf::Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(message.get_size());
    let mut writer = Writer::new(&mut buf);
    message.write_message(&mut writer)?;
    Ok(buf)
}

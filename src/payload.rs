//! Messages broadcast by the decider to the other workers.
//!
//! The decider sends an [AggregationHeader] once the output datacube exists, then the group counts
//! of the reduced dimension in a second message whose length the header announces. Both messages
//! start with a version byte; integers are big-endian and strings are length-prefixed.

use crate::error::{CubeError, SUCCESS};
use crate::models::{BlockOperation, BlockTask, DType, FragmentIds};
use crate::types::{DValue, Missing};

use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Version of the wire format.
pub const PAYLOAD_VERSION: u8 = 1;

/// Parameters shared by every worker of one aggregation.
#[derive(Clone, Debug, PartialEq)]
pub struct AggregationHeader {
    /// Outcome of the decider's setup; workers aggregate only on [SUCCESS]
    pub code: i32,
    pub container_id: u64,
    pub input_datacube_id: u64,
    pub output_datacube_id: u64,
    /// Fragments of the input datacube
    pub frag_ids: FragmentIds,
    pub compressed: bool,
    pub operation: BlockOperation,
    /// Measure type of the input datacube
    pub measure_type: DType,
    pub missing: Option<Missing<DValue>>,
    /// Size of the reduced dimension in the output datacube
    pub explicit_axis_size: u64,
    /// Number of group counts sent in the second message
    pub group_count_len: u64,
    pub block_size: u64,
    pub array_length: u64,
    pub input_tuplexfragment: u64,
    pub output_tuplexfragment: u64,
}

fn operation_tag(operation: BlockOperation) -> u8 {
    match operation {
        BlockOperation::Sum => 1,
        BlockOperation::Avg => 2,
        BlockOperation::Max => 3,
        BlockOperation::Min => 4,
        BlockOperation::Count => 5,
    }
}

fn operation_from_tag(tag: u8) -> Option<BlockOperation> {
    match tag {
        1 => Some(BlockOperation::Sum),
        2 => Some(BlockOperation::Avg),
        3 => Some(BlockOperation::Max),
        4 => Some(BlockOperation::Min),
        5 => Some(BlockOperation::Count),
        _ => None,
    }
}

fn malformed(message: impl Into<String>) -> CubeError {
    CubeError::Payload {
        message: message.into(),
    }
}

/// Reads from a buffer, failing instead of panicking when it is too short.
struct Reader {
    buf: Bytes,
}

impl Reader {
    fn ensure(&self, len: usize) -> Result<(), CubeError> {
        if self.buf.remaining() < len {
            return Err(malformed(format!(
                "expected {} more bytes, found {}",
                len,
                self.buf.remaining()
            )));
        }
        Ok(())
    }

    fn u8(&mut self) -> Result<u8, CubeError> {
        self.ensure(1)?;
        Ok(self.buf.get_u8())
    }

    fn i32(&mut self) -> Result<i32, CubeError> {
        self.ensure(4)?;
        Ok(self.buf.get_i32())
    }

    fn u64(&mut self) -> Result<u64, CubeError> {
        self.ensure(8)?;
        Ok(self.buf.get_u64())
    }

    fn bytes(&mut self) -> Result<Bytes, CubeError> {
        let len = usize::try_from(self.u64()?)?;
        self.ensure(len)?;
        Ok(self.buf.split_to(len))
    }

    fn version(&mut self) -> Result<(), CubeError> {
        match self.u8()? {
            PAYLOAD_VERSION => Ok(()),
            version => Err(malformed(format!("unsupported version {}", version))),
        }
    }

    fn finish(self) -> Result<(), CubeError> {
        if self.buf.has_remaining() {
            return Err(malformed(format!(
                "{} trailing bytes",
                self.buf.remaining()
            )));
        }
        Ok(())
    }
}

fn put_bytes(buf: &mut BytesMut, data: &[u8]) {
    buf.put_u64(data.len() as u64);
    buf.put_slice(data);
}

impl AggregationHeader {
    /// Returns the header announcing that the decider failed with `code`.
    pub fn failed(code: i32) -> Self {
        Self {
            code,
            container_id: 0,
            input_datacube_id: 0,
            output_datacube_id: 0,
            frag_ids: FragmentIds::default(),
            compressed: false,
            operation: BlockOperation::Sum,
            measure_type: DType::Byte,
            missing: None,
            explicit_axis_size: 0,
            group_count_len: 0,
            block_size: 0,
            array_length: 0,
            input_tuplexfragment: 0,
            output_tuplexfragment: 0,
        }
    }

    pub fn is_success(&self) -> bool {
        self.code == SUCCESS
    }

    /// Returns the aggregation each fragment goes through.
    pub fn block_task(&self, group_counts: Vec<u64>) -> BlockTask {
        BlockTask {
            operation: self.operation,
            measure_type: self.measure_type,
            missing: self.missing.clone(),
            block_size: self.block_size,
            group_counts,
            array_length: self.array_length,
            compressed: self.compressed,
        }
    }

    pub fn encode(&self) -> Result<Bytes, CubeError> {
        let frag_ids = self.frag_ids.to_string();
        let missing = match &self.missing {
            Some(missing) => serde_json::to_vec(missing).map_err(|err| malformed(err.to_string()))?,
            None => vec![],
        };
        let mut buf = BytesMut::with_capacity(128 + frag_ids.len() + missing.len());
        buf.put_u8(PAYLOAD_VERSION);
        buf.put_i32(self.code);
        buf.put_u64(self.container_id);
        buf.put_u64(self.input_datacube_id);
        buf.put_u64(self.output_datacube_id);
        put_bytes(&mut buf, frag_ids.as_bytes());
        buf.put_u8(u8::from(self.compressed));
        buf.put_u8(operation_tag(self.operation));
        buf.put_u8(self.measure_type.tag());
        put_bytes(&mut buf, &missing);
        buf.put_u64(self.explicit_axis_size);
        buf.put_u64(self.group_count_len);
        buf.put_u64(self.block_size);
        buf.put_u64(self.array_length);
        buf.put_u64(self.input_tuplexfragment);
        buf.put_u64(self.output_tuplexfragment);
        Ok(buf.freeze())
    }

    pub fn decode(data: Bytes) -> Result<Self, CubeError> {
        let mut reader = Reader { buf: data };
        reader.version()?;
        let code = reader.i32()?;
        let container_id = reader.u64()?;
        let input_datacube_id = reader.u64()?;
        let output_datacube_id = reader.u64()?;
        let frag_ids = std::str::from_utf8(&reader.bytes()?)
            .map_err(|_| malformed("fragment ids are not UTF-8"))?
            .parse()?;
        let compressed = match reader.u8()? {
            0 => false,
            1 => true,
            flag => return Err(malformed(format!("invalid compressed flag {}", flag))),
        };
        let tag = reader.u8()?;
        let operation =
            operation_from_tag(tag).ok_or_else(|| malformed(format!("operation tag {}", tag)))?;
        let tag = reader.u8()?;
        let measure_type =
            DType::from_tag(tag).ok_or_else(|| malformed(format!("measure type tag {}", tag)))?;
        let missing = reader.bytes()?;
        let missing = if missing.is_empty() {
            None
        } else {
            Some(serde_json::from_slice(&missing).map_err(|err| malformed(err.to_string()))?)
        };
        let header = Self {
            code,
            container_id,
            input_datacube_id,
            output_datacube_id,
            frag_ids,
            compressed,
            operation,
            measure_type,
            missing,
            explicit_axis_size: reader.u64()?,
            group_count_len: reader.u64()?,
            block_size: reader.u64()?,
            array_length: reader.u64()?,
            input_tuplexfragment: reader.u64()?,
            output_tuplexfragment: reader.u64()?,
        };
        reader.finish()?;
        Ok(header)
    }
}

/// Encodes the group counts of the reduced dimension.
pub fn encode_group_counts(counts: &[u64]) -> Bytes {
    let mut buf = BytesMut::with_capacity(1 + 8 * counts.len());
    buf.put_u8(PAYLOAD_VERSION);
    for count in counts {
        buf.put_u64(*count);
    }
    buf.freeze()
}

/// Decodes exactly `len` group counts.
pub fn decode_group_counts(data: Bytes, len: u64) -> Result<Vec<u64>, CubeError> {
    let mut reader = Reader { buf: data };
    reader.version()?;
    let counts = (0..len)
        .map(|_| reader.u64())
        .collect::<Result<Vec<_>, _>>()?;
    reader.finish()?;
    Ok(counts)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header() -> AggregationHeader {
        AggregationHeader {
            code: SUCCESS,
            container_id: 1,
            input_datacube_id: 2,
            output_datacube_id: 9,
            frag_ids: "1-4,7".parse().unwrap(),
            compressed: true,
            operation: BlockOperation::Avg,
            measure_type: DType::Float,
            missing: Some(Missing::ValidRange(
                DValue::from_f64(-1.5).unwrap(),
                DValue::from(40),
            )),
            explicit_axis_size: 2,
            group_count_len: 2,
            block_size: 3,
            array_length: 8,
            input_tuplexfragment: 48,
            output_tuplexfragment: 2,
        }
    }

    #[test]
    fn header_survives_the_wire() {
        let header = header();
        assert_eq!(
            header,
            AggregationHeader::decode(header.encode().unwrap()).unwrap()
        );
    }

    #[test]
    fn failed_header() {
        let header = AggregationHeader::failed(-6);
        let decoded = AggregationHeader::decode(header.encode().unwrap()).unwrap();
        assert!(!decoded.is_success());
        assert_eq!(-6, decoded.code);
    }

    #[test]
    fn block_task() {
        let task = header().block_task(vec![24, 24]);
        assert_eq!(48, task.input_slab() / 3);
        assert_eq!(DType::Float, task.output_type());
        assert!(task.compressed);
    }

    #[test]
    fn unknown_version() {
        let mut data = BytesMut::from(&header().encode().unwrap()[..]);
        data[0] = 2;
        let err = AggregationHeader::decode(data.freeze()).unwrap_err();
        assert_eq!(err.to_string(), "malformed broadcast payload: unsupported version 2");
    }

    #[test]
    fn truncated_header() {
        let data = header().encode().unwrap();
        let err = AggregationHeader::decode(data.slice(..data.len() - 4)).unwrap_err();
        assert_eq!(
            err.to_string(),
            "malformed broadcast payload: expected 8 more bytes, found 4"
        );
    }

    #[test]
    fn trailing_bytes() {
        let mut data = BytesMut::from(&header().encode().unwrap()[..]);
        data.put_u8(0);
        let err = AggregationHeader::decode(data.freeze()).unwrap_err();
        assert_eq!(err.to_string(), "malformed broadcast payload: 1 trailing bytes");
    }

    #[test]
    fn group_counts() {
        let data = encode_group_counts(&[31, 29, 31]);
        assert_eq!(1 + 3 * 8, data.len());
        assert_eq!(vec![31, 29, 31], decode_group_counts(data.clone(), 3).unwrap());
        assert!(decode_group_counts(data.clone(), 4).is_err());
        assert!(decode_group_counts(data, 2).is_err());
    }
}

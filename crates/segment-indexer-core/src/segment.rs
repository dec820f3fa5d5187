//! Segment artifacts: the descriptor wire format published to the
//! catalog and the columnar index file stored inside each archive.

pub mod descriptor;
pub mod index_file;

pub use descriptor::{LoadSpec, SegmentDescriptor, ShardSpec, SEGMENT_BINARY_VERSION};
pub use index_file::{decode_index, encode_index, DecodedIndex, IndexFileError, IndexMeta};

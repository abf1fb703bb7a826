use rkyv::de::deserializers::SharedDeserializeMap;
use rkyv::ser::serializers::AllocSerializer;
use rkyv::validation::validators::DefaultValidator;
use rkyv::{AlignedVec, Archive, CheckBytes, Deserialize, Serialize};

use super::Status;
use crate::core::{BlockId, INodeId};
use crate::ring::ShardId;

/// The scratch space used when serializing messages.
pub const SCRATCH_SPACE: usize = 4096;

#[derive(Serialize, Deserialize, Archive, Debug, Clone, PartialEq, Eq)]
#[archive(check_bytes)]
/// A storage operation sent from one peer to another.
pub enum StorageRequest {
    GetBlock(BlockId),
    PutBlock { id: BlockId, data: Vec<u8> },
    GetINode(INodeId),
    PutINode { id: INodeId, record: Vec<u8> },
    /// Enumerates every key the peer holds within a shard.
    ///
    /// The partition count lets the peer compute shard membership
    /// without knowing which ring version the sender is working from.
    ListShard { shard: ShardId, partitions: u32 },
}

impl StorageRequest {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            StorageRequest::GetBlock(_) => "get_block",
            StorageRequest::PutBlock { .. } => "put_block",
            StorageRequest::GetINode(_) => "get_inode",
            StorageRequest::PutINode { .. } => "put_inode",
            StorageRequest::ListShard { .. } => "list_shard",
        }
    }
}

#[derive(Serialize, Deserialize, Archive, Debug, Clone, PartialEq, Eq)]
#[archive(check_bytes)]
/// The successful result of a [StorageRequest].
pub enum StorageReply {
    Block(Vec<u8>),
    INode(Vec<u8>),
    Ack,
    Shard {
        blocks: Vec<BlockId>,
        inodes: Vec<INodeId>,
    },
}

/// Serializes a message into its archived form.
pub(crate) fn encode<T>(value: &T) -> Result<AlignedVec, Status>
where
    T: Serialize<AllocSerializer<SCRATCH_SPACE>>,
{
    rkyv::to_bytes::<_, SCRATCH_SPACE>(value).map_err(|e| Status::internal(format!("{e:?}")))
}

/// Validates and deserializes an archived message.
///
/// The buffer is copied into an aligned buffer first as the transport
/// makes no alignment guarantees.
pub(crate) fn decode<T>(buffer: &[u8]) -> Result<T, Status>
where
    T: Archive,
    T::Archived: 'static
        + for<'a> CheckBytes<DefaultValidator<'a>>
        + Deserialize<T, SharedDeserializeMap>,
{
    let mut aligned = AlignedVec::with_capacity(buffer.len());
    aligned.extend_from_slice(buffer);
    rkyv::from_bytes::<T>(&aligned).map_err(|_| Status::invalid())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::ErrorCode;

    #[test]
    fn test_request_decoding_rejects_garbage() {
        let result = decode::<StorageRequest>(b"definitely not a request");
        assert_eq!(result.map_err(|e| e.code), Err(ErrorCode::InvalidPayload));
    }

    #[test]
    fn test_list_shard_reply() {
        let reply = StorageReply::Shard {
            blocks: vec![BlockId::new(1, 2, 3), BlockId::new(1, 2, 4)],
            inodes: vec![INodeId::new(1, 2)],
        };
        let buffer = encode(&reply).expect("Encode reply");
        let decoded = decode::<StorageReply>(&buffer).expect("Decode reply");
        assert_eq!(decoded, reply);

        let request = StorageRequest::ListShard {
            shard: ShardId::inode(12),
            partitions: 256,
        };
        let buffer = encode(&request).expect("Encode request");
        assert_eq!(decode::<StorageRequest>(&buffer).expect("Decode request"), request);
    }
}

/*
 * Copyright (c) 2025 pgElephant. All rights reserved.
 *
 * HybridDB - Primary/replica document database access layer
 * Built with Rust for superior performance and reliability
 *
 * @file operation.rs
 * @brief Routing classification of collection operations
 */

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReplicationStrategy {
    Replay,
    FullResync,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Read,
    Write(ReplicationStrategy),
    Admin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Find,
    FindOne,
    CountDocuments,
    EstimatedDocumentCount,
    Distinct,
    Aggregate,
    InsertOne,
    InsertMany,
    UpdateOne,
    UpdateMany,
    ReplaceOne,
    DeleteOne,
    DeleteMany,
    FindOneAndUpdate,
    FindOneAndReplace,
    FindOneAndDelete,
    CreateIndex,
    ListIndexes,
    Drop,
}

impl Operation {
    pub const ALL: [Operation; 19] = [
        Operation::Find,
        Operation::FindOne,
        Operation::CountDocuments,
        Operation::EstimatedDocumentCount,
        Operation::Distinct,
        Operation::Aggregate,
        Operation::InsertOne,
        Operation::InsertMany,
        Operation::UpdateOne,
        Operation::UpdateMany,
        Operation::ReplaceOne,
        Operation::DeleteOne,
        Operation::DeleteMany,
        Operation::FindOneAndUpdate,
        Operation::FindOneAndReplace,
        Operation::FindOneAndDelete,
        Operation::CreateIndex,
        Operation::ListIndexes,
        Operation::Drop,
    ];

    pub const fn kind(self) -> OperationKind {
        use Operation::*;
        match self {
            Find | FindOne | CountDocuments | EstimatedDocumentCount | Distinct | Aggregate => OperationKind::Read,
            InsertOne | InsertMany => OperationKind::Write(ReplicationStrategy::Replay),
            UpdateOne | UpdateMany | ReplaceOne | DeleteOne | DeleteMany | FindOneAndUpdate
            | FindOneAndReplace | FindOneAndDelete => OperationKind::Write(ReplicationStrategy::FullResync),
            CreateIndex | ListIndexes | Drop => OperationKind::Admin,
        }
    }

    pub const fn is_read(self) -> bool {
        matches!(self.kind(), OperationKind::Read)
    }

    pub const fn is_write(self) -> bool {
        matches!(self.kind(), OperationKind::Write(_))
    }

    pub fn name(self) -> &'static str {
        match self {
            Operation::Find => "find",
            Operation::FindOne => "findOne",
            Operation::CountDocuments => "countDocuments",
            Operation::EstimatedDocumentCount => "estimatedDocumentCount",
            Operation::Distinct => "distinct",
            Operation::Aggregate => "aggregate",
            Operation::InsertOne => "insertOne",
            Operation::InsertMany => "insertMany",
            Operation::UpdateOne => "updateOne",
            Operation::UpdateMany => "updateMany",
            Operation::ReplaceOne => "replaceOne",
            Operation::DeleteOne => "deleteOne",
            Operation::DeleteMany => "deleteMany",
            Operation::FindOneAndUpdate => "findOneAndUpdate",
            Operation::FindOneAndReplace => "findOneAndReplace",
            Operation::FindOneAndDelete => "findOneAndDelete",
            Operation::CreateIndex => "createIndex",
            Operation::ListIndexes => "listIndexes",
            Operation::Drop => "drop",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inserts_replay_and_other_writes_resync() {
        assert_eq!(Operation::InsertOne.kind(), OperationKind::Write(ReplicationStrategy::Replay));
        assert_eq!(Operation::InsertMany.kind(), OperationKind::Write(ReplicationStrategy::Replay));
        for op in [
            Operation::UpdateOne,
            Operation::UpdateMany,
            Operation::ReplaceOne,
            Operation::DeleteOne,
            Operation::DeleteMany,
            Operation::FindOneAndUpdate,
            Operation::FindOneAndReplace,
            Operation::FindOneAndDelete,
        ] {
            assert_eq!(op.kind(), OperationKind::Write(ReplicationStrategy::FullResync), "{}", op);
        }
    }

    #[test]
    fn test_classification_covers_every_operation() {
        let reads = Operation::ALL.iter().filter(|op| op.is_read()).count();
        let writes = Operation::ALL.iter().filter(|op| op.is_write()).count();
        let admin = Operation::ALL
            .iter()
            .filter(|op| op.kind() == OperationKind::Admin)
            .count();
        assert_eq!((reads, writes, admin), (6, 10, 3));
    }
}

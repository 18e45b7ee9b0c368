use num_enum::{IntoPrimitive, TryFromPrimitive};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(u16)]
pub enum ResourceType {
    Connection = 0x0000,
    Database = 0x0001,
    Collection = 0x0002,
    Document = 0x0003,
    Attachment = 0x0004,
    User = 0x0005,
    Permission = 0x0006,
    StoredProcedure = 0x0007,
    Conflict = 0x0008,
    Trigger = 0x0009,
    UserDefinedFunction = 0x000A,
    Module = 0x000B,
    Replica = 0x000C,
    ModuleCommand = 0x000D,
    Record = 0x000E,
    Offer = 0x000F,
    PartitionSetInformation = 0x0010,
    XpReplicatorAddress = 0x0011,
    MasterPartition = 0x0012,
    ServerPartition = 0x0013,
    DatabaseAccount = 0x0014,
    Topology = 0x0015,
    PartitionKeyRange = 0x0016,
    Schema = 0x0018,
    BatchApply = 0x0019,
    RestoreMetadata = 0x001A,
    ComputeGatewayCharges = 0x001B,
    RidRange = 0x001C,
    UserDefinedType = 0x001D,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(u16)]
pub enum OperationType {
    Connection = 0x0000,
    Create = 0x0001,
    Update = 0x0002,
    Read = 0x0003,
    ReadFeed = 0x0004,
    Delete = 0x0005,
    Replace = 0x0006,
    ExecuteJavaScript = 0x0008,
    SqlQuery = 0x0009,
    Pause = 0x000A,
    Resume = 0x000B,
    Stop = 0x000C,
    Recycle = 0x000D,
    Crash = 0x000E,
    Query = 0x000F,
    ForceConfigRefresh = 0x0010,
    Head = 0x0011,
    HeadFeed = 0x0012,
    Upsert = 0x0013,
    Recreate = 0x0014,
    Throttle = 0x0015,
    GetSplitPoint = 0x0016,
    PreCreateValidation = 0x0017,
    BatchApply = 0x0018,
    AbortSplit = 0x0019,
    CompleteSplit = 0x001A,
    OfferUpdateOperation = 0x001B,
    OfferPreGrowValidation = 0x001C,
    BatchReportThroughputUtilization = 0x001D,
    CompletePartitionMigration = 0x001E,
    AbortPartitionMigration = 0x001F,
    PreReplaceValidation = 0x0020,
    AddComputeGatewayRequestCharges = 0x0021,
    MigratePartition = 0x0022,
    Batch = 0x0025,
}

impl OperationType {
    /// operations that do not modify data and may be retried freely
    pub fn is_read_only(self) -> bool {
        use OperationType::*;
        matches!(self, Read | ReadFeed | SqlQuery | Query | Head | HeadFeed)
    }
}

/// Consistency level, as transmitted in the `ConsistencyLevel` request token
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum ConsistencyLevel {
    Strong = 0x00,
    BoundedStaleness = 0x01,
    Session = 0x02,
    Eventual = 0x03,
    ConsistentPrefix = 0x04,
}

impl ConsistencyLevel {
    pub fn from_name(name: &str) -> Option<ConsistencyLevel> {
        [
            ("Strong", ConsistencyLevel::Strong),
            ("BoundedStaleness", ConsistencyLevel::BoundedStaleness),
            ("Session", ConsistencyLevel::Session),
            ("Eventual", ConsistencyLevel::Eventual),
            ("ConsistentPrefix", ConsistencyLevel::ConsistentPrefix),
        ].into_iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, level)| level)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum IndexingDirective {
    Default = 0x00,
    Include = 0x01,
    Exclude = 0x02,
}

impl IndexingDirective {
    pub fn from_name(name: &str) -> Option<IndexingDirective> {
        [
            ("Default", IndexingDirective::Default),
            ("Include", IndexingDirective::Include),
            ("Exclude", IndexingDirective::Exclude),
        ].into_iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, d)| d)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum MigrateCollectionDirective {
    Thaw = 0x00,
    Freeze = 0x01,
}

impl MigrateCollectionDirective {
    pub fn from_name(name: &str) -> Option<MigrateCollectionDirective> {
        if name.eq_ignore_ascii_case("Thaw") {
            Some(MigrateCollectionDirective::Thaw)
        }
        else if name.eq_ignore_ascii_case("Freeze") {
            Some(MigrateCollectionDirective::Freeze)
        }
        else {
            None
        }
    }
}

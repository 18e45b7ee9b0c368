//! Identifier tables for metadata tokens. Each entry maps a token identifier to its declared
//!  token type and, for fields that correspond to a logical request / response header, the
//!  header's name.

use crate::wire::token::TokenType;

macro_rules! token_table {
    (@header $header:literal) => { Some($header) };
    (@header) => { None };
    (
        $(#[$meta:meta])*
        $vis:vis enum $name:ident {
            $( $variant:ident = $id:literal : $token_type:ident $(=> $header:literal)? ),* $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u16)]
        $vis enum $name {
            $( $variant = $id, )*
        }

        impl $name {
            pub const ALL: &'static [$name] = &[ $( $name::$variant, )* ];

            pub const fn id(self) -> u16 {
                self as u16
            }

            pub const fn token_type(self) -> TokenType {
                match self {
                    $( $name::$variant => TokenType::$token_type, )*
                }
            }

            pub fn header_name(self) -> Option<&'static str> {
                match self {
                    $( $name::$variant => token_table!(@header $($header)?), )*
                }
            }

            pub fn from_id(id: u16) -> Option<$name> {
                match id {
                    $( $id => Some($name::$variant), )*
                    _ => None,
                }
            }

            /// header names are matched case insensitively
            pub fn from_header_name(name: &str) -> Option<$name> {
                Self::ALL.iter()
                    .copied()
                    .find(|h| h.header_name().is_some_and(|n| n.eq_ignore_ascii_case(name)))
            }
        }
    };
}

token_table! {
    pub enum RequestHeader {
        ResourceId = 0x0000: Bytes,
        AuthorizationToken = 0x0001: String => "authorization",
        PayloadPresent = 0x0002: Byte,
        Date = 0x0003: SmallString => "x-ms-date",
        PageSize = 0x0004: ULong => "x-ms-max-item-count",
        SessionToken = 0x0005: String => "x-ms-session-token",
        ContinuationToken = 0x0006: String => "x-ms-continuation",
        IndexingDirective = 0x0007: Byte => "x-ms-indexing-directive",
        Match = 0x0008: String => "if-none-match",
        PreTriggerInclude = 0x0009: String => "x-ms-documentdb-pre-trigger-include",
        PostTriggerInclude = 0x000A: String => "x-ms-documentdb-post-trigger-include",
        IsFanout = 0x000B: Byte => "x-ms-is-fanout-request",
        CollectionPartitionIndex = 0x000C: ULong => "collection-partition-index",
        CollectionServiceIndex = 0x000D: ULong => "collection-service-index",
        PreTriggerExclude = 0x000E: String => "x-ms-documentdb-pre-trigger-exclude",
        PostTriggerExclude = 0x000F: String => "x-ms-documentdb-post-trigger-exclude",
        ConsistencyLevel = 0x0010: Byte => "x-ms-consistency-level",
        EntityId = 0x0011: String,
        ResourceSchemaName = 0x0012: SmallString,
        ReplicaPath = 0x0013: String,
        ResourceTokenExpiry = 0x0014: ULong => "x-ms-documentdb-expiry-seconds",
        DatabaseName = 0x0015: String,
        CollectionName = 0x0016: String,
        DocumentName = 0x0017: String,
        AttachmentName = 0x0018: String,
        UserName = 0x0019: String,
        PermissionName = 0x001A: String,
        StoredProcedureName = 0x001B: String,
        UserDefinedFunctionName = 0x001C: String,
        TriggerName = 0x001D: String,
        EnableScanInQuery = 0x001E: Byte => "x-ms-documentdb-query-enable-scan",
        EmitVerboseTracesInQuery = 0x001F: Byte => "x-ms-documentdb-query-emit-traces",
        ConflictName = 0x0020: String,
        BindReplicaDirective = 0x0021: String => "x-ms-bind-replica",
        PrimaryMasterKey = 0x0022: String,
        SecondaryMasterKey = 0x0023: String,
        PrimaryReadonlyKey = 0x0024: String,
        SecondaryReadonlyKey = 0x0025: String,
        ProfileRequest = 0x0026: Byte => "x-ms-profile-request",
        EnableLowPrecisionOrderBy = 0x0027: Byte => "x-ms-documentdb-query-enable-low-precision-order-by",
        ClientVersion = 0x0028: SmallString => "x-ms-version",
        CanCharge = 0x0029: Byte => "x-ms-cancharge",
        CanThrottle = 0x002A: Byte => "x-ms-canthrottle",
        PartitionKey = 0x002B: String => "x-ms-documentdb-partitionkey",
        PartitionKeyRangeId = 0x002C: String => "x-ms-documentdb-partitionkeyrangeid",
        MigrateCollectionDirective = 0x0031: Byte => "x-ms-migratecollection-directive",
        SupportSpatialLegacyCoordinates = 0x0033: Byte => "x-ms-documentdb-supportspatiallegacycoordinates",
        PartitionCount = 0x0034: ULong => "x-ms-documentdb-partitioncount",
        TransportRequestId = 0x0035: ULong,
        CollectionRid = 0x0036: String => "x-ms-collection-rid",
        FilterBySchemaRid = 0x0037: String => "x-ms-documentdb-filterby-schema-rid",
        UsePolygonsSmallerThanAHemisphere = 0x0038: Byte => "x-ms-documentdb-usepolygonssmallerthanahemisphere",
        GatewaySignature = 0x0039: String => "x-ms-gateway-signature",
        EnableLogging = 0x003A: Byte => "x-ms-documentdb-script-enable-logging",
        AIm = 0x003B: String => "a-im",
        PopulateQuotaInfo = 0x003C: Byte => "x-ms-documentdb-populatequotainfo",
        DisableRuPerMinuteUsage = 0x003D: Byte => "x-ms-documentdb-disable-ru-per-minute-usage",
        PopulateQueryMetrics = 0x003E: Byte => "x-ms-documentdb-populatequerymetrics",
        ResponseContinuationTokenLimitInKb = 0x003F: ULong => "x-ms-documentdb-responsecontinuationtokenlimitinkb",
        PopulatePartitionStatistics = 0x0040: Byte => "x-ms-documentdb-populatepartitionstatistics",
        RemoteStorageType = 0x0041: Byte => "x-ms-remote-storage-type",
        CollectionRemoteStorageSecurityIdentifier = 0x0042: String => "x-ms-collection-security-identifier",
        IfModifiedSince = 0x0043: String => "if-modified-since",
        PopulateCollectionThroughputInfo = 0x0044: Byte => "x-ms-documentdb-populatecollectionthroughputinfo",
        RemainingTimeInMsOnClientRequest = 0x0045: ULong => "x-ms-remaining-time-in-ms-on-client",
        ClientRetryAttemptCount = 0x0046: ULong => "x-ms-client-retry-attempt-count",
        TargetLsn = 0x0047: LongLong => "x-ms-target-lsn",
        TargetGlobalCommittedLsn = 0x0048: LongLong => "x-ms-target-global-committed-lsn",
        TransportRequestIdRetries = 0x0049: ULong,
        ForceQueryScan = 0x0051: Byte => "x-ms-documentdb-force-query-scan",
        EffectivePartitionKey = 0x005A: Bytes,
        IsBatchRequest = 0x0060: Byte => "x-ms-cosmos-is-batch-request",
        IsBatchAtomic = 0x0061: Byte => "x-ms-cosmos-batch-atomic",
        ShouldBatchContinueOnError = 0x0062: Byte => "x-ms-cosmos-batch-continue-on-error",
        SdkSupportedCapabilities = 0x00A2: ULong => "x-ms-cosmos-sdk-supportedcapabilities",
    }
}

token_table! {
    pub enum ResponseHeader {
        PayloadPresent = 0x0000: Byte,
        LastStateChangeDateTime = 0x0002: SmallString => "x-ms-last-state-change-utc",
        ContinuationToken = 0x0003: String => "x-ms-continuation",
        ETag = 0x0004: String => "etag",
        ReadsPerformed = 0x0007: ULong => "x-ms-reads-performed",
        WritesPerformed = 0x0008: ULong => "x-ms-writes-performed",
        QueriesPerformed = 0x0009: ULong => "x-ms-queries-performed",
        IndexTermsGenerated = 0x000A: ULong => "x-ms-index-terms-generated",
        ScriptsExecuted = 0x000B: ULong => "x-ms-scripts-executed",
        RetryAfterMilliseconds = 0x000C: ULong => "x-ms-retry-after-ms",
        IndexingDirective = 0x000D: Byte => "x-ms-indexing-directive",
        StorageMaxResourceQuota = 0x000E: String => "x-ms-resource-quota",
        StorageResourceQuotaUsage = 0x000F: String => "x-ms-resource-usage",
        SchemaVersion = 0x0010: SmallString => "x-ms-schemaversion",
        CollectionPartitionIndex = 0x0011: ULong => "collection-partition-index",
        CollectionServiceIndex = 0x0012: ULong => "collection-service-index",
        Lsn = 0x0013: LongLong => "lsn",
        ItemCount = 0x0014: ULong => "x-ms-item-count",
        RequestCharge = 0x0015: Double => "x-ms-request-charge",
        OwnerFullName = 0x0017: String => "x-ms-alt-content-path",
        OwnerId = 0x0018: String => "x-ms-content-path",
        DatabaseAccountId = 0x0019: String => "x-ms-database-account-id",
        QuorumAckedLsn = 0x001A: LongLong => "x-ms-quorum-acked-lsn",
        RequestValidationFailure = 0x001B: Byte => "x-ms-request-validation-failure",
        SubStatus = 0x001C: ULong => "x-ms-substatus",
        CollectionUpdateProgress = 0x001D: ULong => "x-ms-documentdb-collection-index-transformation-progress",
        CurrentWriteQuorum = 0x001E: ULong => "x-ms-current-write-quorum",
        CurrentReplicaSetSize = 0x001F: ULong => "x-ms-current-replica-set-size",
        CollectionLazyIndexProgress = 0x0020: ULong => "x-ms-documentdb-collection-lazy-indexing-progress",
        PartitionKeyRangeId = 0x0021: String => "x-ms-documentdb-partitionkeyrangeid",
        LogResults = 0x0025: String => "x-ms-documentdb-script-log-results",
        XpRole = 0x0026: ULong => "x-ms-xp-role",
        IsRuPerMinuteUsed = 0x0027: Byte => "x-ms-documentdb-is-ru-per-minute-used",
        QueryMetrics = 0x0028: String => "x-ms-documentdb-query-metrics",
        GlobalCommittedLsn = 0x0029: LongLong => "x-ms-global-committed-lsn",
        NumberOfReadRegions = 0x0030: ULong => "x-ms-number-of-read-regions",
        OfferReplacePending = 0x0031: Byte => "x-ms-offer-replace-pending",
        ItemLsn = 0x0032: LongLong => "x-ms-item-lsn",
        RestoreState = 0x0033: String => "x-ms-restore-state",
        CollectionSecurityIdentifier = 0x0034: String => "x-ms-collection-security-identifier",
        TransportRequestId = 0x0035: ULong,
        ShareThroughput = 0x0036: Byte => "x-ms-share-throughput",
        DisableRntbdChannel = 0x0038: Byte => "x-ms-disable-rntbd-channel",
        ServerDateTimeUtc = 0x0039: SmallString => "x-ms-date",
        LocalLsn = 0x003A: LongLong => "x-ms-cosmos-llsn",
        QuorumAckedLocalLsn = 0x003B: LongLong => "x-ms-cosmos-quorum-acked-llsn",
        ItemLocalLsn = 0x003C: LongLong => "x-ms-cosmos-item-llsn",
        HasTentativeWrites = 0x003D: Byte => "x-ms-cosmosdb-has-tentative-writes",
        SessionToken = 0x003E: String => "x-ms-session-token",
        BackendRequestDurationMilliseconds = 0x0051: Double => "x-ms-request-duration-ms",
    }
}

token_table! {
    /// tokens of the context negotiation request
    pub enum ContextRequestToken {
        ProtocolVersion = 0x0000: ULong,
        ClientVersion = 0x0001: SmallString,
        UserAgent = 0x0002: SmallString,
    }
}

token_table! {
    /// tokens of the context negotiation response
    pub enum ContextResponseToken {
        ProtocolVersion = 0x0000: ULong,
        ClientVersion = 0x0001: SmallString,
        ServerAgent = 0x0002: SmallString,
        ServerVersion = 0x0003: SmallString,
        IdleTimeoutInSeconds = 0x0004: ULong,
        UnauthenticatedTimeoutInSeconds = 0x0005: ULong,
    }
}

pub mod channel_dictionary;
pub mod lb_channel;
pub mod lb_channel_state;
pub mod partition;

pub use channel_dictionary::ChannelDictionary;
pub use lb_channel::LoadBalancingChannel;
pub use partition::LoadBalancingPartition;

pub mod channel {
    pub mod v1 {
        tonic::include_proto!("conductor.channel.v1");
    }
}

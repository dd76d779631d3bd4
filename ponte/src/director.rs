use tonic::{metadata::MetadataMap, transport::Channel, Status};

/// Routing strategy: map an inbound call to rewritten metadata and a backend
/// connection. One implementation exists today; multi-backend variants slot
/// in behind the same seam.
pub trait Director: Send + Sync {
    fn route(&self, metadata: &MetadataMap, method: &str) -> Result<(MetadataMap, Channel), Status>;
}

/// Every call goes to the one upstream dialed at startup.
#[derive(Debug, Clone)]
pub struct SingleBackend {
    upstream: Channel,
}

impl SingleBackend {
    pub fn new(upstream: Channel) -> Self {
        Self { upstream }
    }
}

impl Director for SingleBackend {
    fn route(
        &self,
        metadata: &MetadataMap,
        _method: &str,
    ) -> Result<(MetadataMap, Channel), Status> {
        let mut outgoing = metadata.clone();
        // Transport-hop headers. A forwarded `connection` makes some backend
        // stacks treat the hop as already established and skip dialing the
        // real one (improbable-eng/grpc-web#568).
        outgoing.remove("user-agent");
        outgoing.remove("connection");
        Ok((outgoing, self.upstream.clone()))
    }
}

#[cfg(test)]
mod tests {
    use tonic::transport::Endpoint;

    use super::*;

    fn lazy_channel() -> Channel {
        Endpoint::from_static("http://127.0.0.1:50051").connect_lazy()
    }

    #[tokio::test]
    async fn transport_headers_are_stripped() {
        let mut metadata = MetadataMap::new();
        metadata.insert("user-agent", "grpc-web-js/0.1".parse().unwrap());
        metadata.insert("connection", "keep-alive".parse().unwrap());
        metadata.insert("authorization", "Bearer token".parse().unwrap());
        let director = SingleBackend::new(lazy_channel());

        let (outgoing, _) = director.route(&metadata, "/pkg.Svc/Call").unwrap();

        assert!(outgoing.get("user-agent").is_none());
        assert!(outgoing.get("connection").is_none());
        assert_eq!(outgoing.get("authorization").unwrap(), "Bearer token");
    }

    #[tokio::test]
    async fn multi_valued_keys_keep_their_order() {
        let mut metadata = MetadataMap::new();
        metadata.append("x-trace", "first".parse().unwrap());
        metadata.append("x-trace", "second".parse().unwrap());
        metadata.append("user-agent", "strip-me".parse().unwrap());
        let director = SingleBackend::new(lazy_channel());

        let (outgoing, _) = director.route(&metadata, "/pkg.Svc/Call").unwrap();

        let values: Vec<_> = outgoing
            .get_all("x-trace")
            .iter()
            .map(|value| value.to_str().unwrap())
            .collect();
        assert_eq!(values, ["first", "second"]);
    }
}

use std::sync::Arc;

use pouch_core::GatewayError;
use pouch_transport::cloud::{CloudError, CloudSession, CloudTransport, DownlinkReceiver};
use thiserror::Error;
use tracing::debug;

use crate::downlink::DownlinkStream;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UplinkError {
    #[error("uplink already closed")]
    Closed,
    #[error("uplink forward failed: {0}")]
    Cloud(#[from] CloudError),
}

impl From<UplinkError> for GatewayError {
    fn from(err: UplinkError) -> Self {
        match err {
            UplinkError::Closed => GatewayError::protocol(err.to_string()),
            UplinkError::Cloud(inner) => inner.into(),
        }
    }
}

/// Device-to-cloud stream. Fragments are forwarded as they arrive.
pub struct Uplink {
    session: Box<dyn CloudSession>,
    closed: bool,
    forwarded: usize,
}

impl Uplink {
    /// Opens the cloud session shared with `downlink`, which receives the
    /// cloud's reply.
    pub fn open(cloud: &dyn CloudTransport, downlink: &DownlinkStream) -> Result<Self, UplinkError> {
        let receiver: Arc<dyn DownlinkReceiver> = Arc::new(downlink.sink());
        let session = cloud.open_session(receiver)?;
        Ok(Self {
            session,
            closed: false,
            forwarded: 0,
        })
    }

    pub fn write(&mut self, payload: &[u8], is_last: bool) -> Result<(), UplinkError> {
        if self.closed {
            return Err(UplinkError::Closed);
        }
        self.session.write_uplink(payload, is_last)?;
        self.forwarded += payload.len();
        if is_last {
            self.closed = true;
            debug!(total = self.forwarded, "uplink final fragment forwarded");
        }
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Payload bytes forwarded so far.
    pub fn forwarded(&self) -> usize {
        self.forwarded
    }

    pub fn close(self) {}
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use pouch_core::OwnerTag;
    use pouch_transport::cloud::InMemoryCloud;

    use super::*;
    use crate::block::BlockPool;

    fn downlink() -> DownlinkStream {
        DownlinkStream::new(
            BlockPool::new(2, 16),
            OwnerTag(3),
            Duration::from_millis(10),
            Arc::new(|| {}),
        )
    }

    #[test]
    fn fragments_are_forwarded_in_order() {
        let cloud = InMemoryCloud::new();
        let stream = downlink();
        let mut uplink = Uplink::open(&cloud, &stream).unwrap();

        uplink.write(b"hello ", false).unwrap();
        uplink.write(b"cloud", true).unwrap();
        assert!(uplink.is_closed());
        assert_eq!(uplink.forwarded(), 11);
        assert_eq!(uplink.write(b"!", true), Err(UplinkError::Closed));

        let sessions = cloud.sessions();
        assert_eq!(sessions[0].uplink, b"hello cloud".to_vec());
        assert!(sessions[0].uplink_complete);
    }

    #[test]
    fn open_failure_is_a_cloud_error() {
        let cloud = InMemoryCloud::new();
        cloud.set_fail_open(true);
        let err = Uplink::open(&cloud, &downlink()).err().unwrap();
        assert_eq!(GatewayError::from(err).class(), "cloud");
    }

    #[test]
    fn rejected_fragment_is_reported() {
        let cloud = InMemoryCloud::new();
        let stream = downlink();
        let mut uplink = Uplink::open(&cloud, &stream).unwrap();
        cloud.set_fail_uplink(true);
        assert_eq!(
            uplink.write(b"x", false),
            Err(UplinkError::Cloud(CloudError::Rejected(500)))
        );
    }
}

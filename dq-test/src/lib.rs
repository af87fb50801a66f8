//! Shared fixtures for `dq-queue`/`dq-scheduler` integration tests.

use testcontainers::ContainerAsync;
use testcontainers::runners::AsyncRunner;
use testcontainers_modules::redis::Redis;

/// A running Redis container plus the URL to reach it.
///
/// Keep the returned container alive for as long as the test needs
/// Redis: dropping it stops and removes the container.
pub struct RedisFixture {
    _container: ContainerAsync<Redis>,
    url: String,
}

impl RedisFixture {
    /// Starts a fresh Redis 7 container and waits until it accepts
    /// connections.
    pub async fn start() -> Self {
        let container = Redis::default()
            .start()
            .await
            .expect("failed to start redis testcontainer");
        let host = container
            .get_host()
            .await
            .expect("failed to resolve testcontainer host");
        let port = container
            .get_host_port_ipv4(6379)
            .await
            .expect("failed to resolve testcontainer port");
        Self {
            _container: container,
            url: format!("redis://{host}:{port}/"),
        }
    }

    /// The connection URL for this fixture's Redis instance.
    pub fn url(&self) -> &str {
        &self.url
    }
}

use {
    crate::{
        config::ConnectionConfig,
        dbus::{BUS_NAME, BUS_PATH, Connection, Method, PEER_INTERFACE},
        it::{
            test_bus::TestBus,
            test_error::{TestErrorExt, TestResult},
        },
    },
    std::sync::Arc,
};

pub struct TestRun {
    pub name: &'static str,
    pub bus: Arc<TestBus>,
}

impl TestRun {
    pub fn config(&self) -> ConnectionConfig {
        ConnectionConfig {
            name: self.name.to_string(),
            ..Default::default()
        }
    }

    /// Connects a new client to the bus and registers it with `Hello`.
    pub fn connect(&self) -> TestResult<Connection> {
        self.connect_with(self.config())
    }

    pub fn connect_with(&self, config: ConnectionConfig) -> TestResult<Connection> {
        Connection::open(self.bus.connect(), config).with_context(|| "Could not connect to the bus")
    }

    /// Returns once everything the bus sent to `conn` before this call has
    /// been dispatched.
    pub fn sync(&self, conn: &Connection) -> TestResult {
        let ping = Method::new(BUS_NAME, BUS_PATH, PEER_INTERFACE, "Ping");
        conn.call_blocking(&ping, &[])
            .with_context(|| "Could not ping the bus")?;
        Ok(())
    }

    pub fn unique_name(&self, conn: &Connection) -> TestResult<String> {
        let name = conn.unique_name().with_context(|| "Connection has no unique name")?;
        Ok(name.to_string())
    }
}

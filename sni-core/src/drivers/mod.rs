//! Backend drivers and their lifecycle.
//!
//! Client drivers (the emulator or cart is dialed by us) register as soon
//! as they are built. Server drivers (the emulator dials us) register once
//! their listener is bound, so the registry never advertises a driver that
//! cannot accept connections yet.

pub mod connectorlib;
pub mod fxpakpro;
pub mod luabridge;
pub mod mock;
pub mod retroarch;

use std::sync::Arc;
use std::thread::JoinHandle;

use crate::config::Config;
use crate::driver::Driver;
use crate::error::SniResult;
use crate::registry::DriverRegistry;
use crate::task::{self, CancelToken};

use connectorlib::ConnectorLibDriver;
use fxpakpro::FxPakProDriver;
use luabridge::LuaBridgeDriver;
use mock::MockDriver;
use retroarch::RetroArchDriver;

/// Every driver started from one configuration snapshot.
pub struct Drivers {
    registry: DriverRegistry,
    cancel: CancelToken,
    listeners: Vec<JoinHandle<()>>,
    drivers: Vec<Arc<dyn Driver>>,
    connectorlib: Option<Arc<ConnectorLibDriver>>,
}

/// Build the enabled drivers and register them with `registry`.
pub fn init(config: &Config, registry: &DriverRegistry) -> SniResult<Drivers> {
    let mut drivers = Drivers {
        registry: registry.clone(),
        cancel: CancelToken::new(),
        listeners: vec![],
        drivers: vec![],
        connectorlib: None,
    };

    if config.mock.enable {
        drivers.add_client(Arc::new(MockDriver::default()))?;
    }
    if !config.retroarch.disable {
        drivers.add_client(Arc::new(RetroArchDriver::new(&config.retroarch)))?;
    }
    if !config.fxpakpro.disable {
        drivers.add_client(Arc::new(FxPakProDriver::new(&config.fxpakpro)))?;
    }

    if !config.luabridge.disable {
        let driver = Arc::new(LuaBridgeDriver::new());
        let accepting = Arc::clone(&driver);
        drivers.add_server(
            driver,
            config.luabridge.listen_addr(),
            move |stream, peer| accepting.accept(stream, peer),
        )?;
    }
    if !config.connectorlib.disable {
        let driver = Arc::new(ConnectorLibDriver::new());
        let accepting = Arc::clone(&driver);
        drivers.add_server(
            Arc::clone(&driver),
            config.connectorlib.listen_addr(),
            move |stream, peer| accepting.accept(stream, peer),
        )?;
        drivers.connectorlib = Some(driver);
    }

    Ok(drivers)
}

impl Drivers {
    fn add_client(&mut self, driver: Arc<dyn Driver>) -> SniResult<()> {
        self.registry.register(Arc::clone(&driver))?;
        self.drivers.push(driver);
        Ok(())
    }

    fn add_server<D, A>(&mut self, driver: Arc<D>, addr: String, on_accept: A) -> SniResult<()>
    where
        D: Driver + 'static,
        A: FnMut(std::net::TcpStream, std::net::SocketAddr) + Send + 'static,
    {
        let registry = self.registry.clone();
        let driver: Arc<dyn Driver> = driver;
        let registering = Arc::clone(&driver);
        let name = driver.name();
        let listener = task::spawn_listener(
            name,
            addr,
            self.cancel.clone(),
            move |_| {
                if let Err(e) = registry.register(Arc::clone(&registering)) {
                    log::warn!("{}: register: {}", name, e);
                }
            },
            on_accept,
        )?;
        self.listeners.push(listener);
        self.drivers.push(driver);
        Ok(())
    }

    /// The connectorlib driver, when enabled, for downstream assignment.
    pub fn connectorlib(&self) -> Option<&Arc<ConnectorLibDriver>> {
        self.connectorlib.as_ref()
    }

    /// Names of every driver started, registered or not.
    pub fn names(&self) -> Vec<&'static str> {
        self.drivers.iter().map(|d| d.name()).collect()
    }

    /// Stop listeners, close every device and unregister every driver.
    pub fn shutdown(mut self) {
        self.cancel.cancel();
        for listener in self.listeners.drain(..) {
            if listener.join().is_err() {
                log::warn!("listener thread panicked");
            }
        }
        for driver in &self.drivers {
            driver.disconnect_all();
            self.registry.unregister(driver.name());
        }
        log::info!("drivers shut down");
    }
}

#[cfg(test)]
mod tests {
    use std::io::{BufRead, BufReader, Write};
    use std::net::TcpStream;
    use std::thread;
    use std::time::{Duration, Instant};

    use super::*;
    use crate::config::{ConnectorLibConfig, LuaBridgeConfig};

    fn local_config() -> Config {
        let mut config = Config::default();
        config.mock.enable = true;
        config.retroarch.disable = true;
        config.fxpakpro.disable = true;
        config.luabridge = LuaBridgeConfig {
            listen_port: 0,
            ..Default::default()
        };
        config.connectorlib = ConnectorLibConfig {
            listen_port: 0,
            ..Default::default()
        };
        config
    }

    fn wait_registered(registry: &DriverRegistry, name: &str) {
        let start = Instant::now();
        while registry.get(name).is_none() {
            assert!(start.elapsed() < Duration::from_secs(5), "{name} never registered");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_init_registers_enabled_drivers() {
        let registry = DriverRegistry::new();
        let drivers = init(&local_config(), &registry).unwrap();
        assert!(registry.get(mock::DRIVER_NAME).is_some());
        assert!(registry.get(retroarch::DRIVER_NAME).is_none());
        assert!(registry.get(fxpakpro::DRIVER_NAME).is_none());

        wait_registered(&registry, luabridge::DRIVER_NAME);
        wait_registered(&registry, connectorlib::DRIVER_NAME);
        assert_eq!(drivers.names().len(), 3);
        assert!(drivers.connectorlib().is_some());

        drivers.shutdown();
        assert!(registry.all_drivers().is_empty());
    }

    #[test]
    fn test_mock_disabled_by_default() {
        let registry = DriverRegistry::new();
        let mut config = Config::default();
        config.retroarch.disable = true;
        config.fxpakpro.disable = true;
        config.luabridge.disable = true;
        config.connectorlib.disable = true;
        let drivers = init(&config, &registry).unwrap();
        assert!(registry.all_drivers().is_empty());
        drivers.shutdown();
    }

    #[test]
    fn test_connectorlib_forwards_to_mock() {
        // fixed port: the listener reports its bound address only to the registry
        let port = {
            let spare = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            spare.local_addr().unwrap().port()
        };
        let mut config = local_config();
        config.luabridge.disable = true;
        config.connectorlib.listen_port = port;

        let registry = DriverRegistry::new();
        let drivers = init(&config, &registry).unwrap();
        wait_registered(&registry, connectorlib::DRIVER_NAME);

        let mock = registry.device(&MockDriver::locator()).unwrap();
        drivers
            .connectorlib()
            .unwrap()
            .set_downstream_device(Some(mock))
            .unwrap();

        let stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
        stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let mut writer = stream.try_clone().unwrap();
        let mut reader = BufReader::new(stream);
        writeln!(writer, r#"{{"id":1,"type":"write","address":8257792,"data":[5,6]}}"#).unwrap();
        writeln!(writer, r#"{{"id":2,"type":"read","address":8257792,"size":2}}"#).unwrap();

        let mut line = String::new();
        reader.read_line(&mut line).unwrap();
        assert_eq!(line.trim_end(), r#"{"id":1,"ok":true,"size":2}"#);
        line.clear();
        reader.read_line(&mut line).unwrap();
        assert_eq!(line.trim_end(), r#"{"id":2,"ok":true,"data":[5,6]}"#);

        drivers.shutdown();
        assert!(registry.get(connectorlib::DRIVER_NAME).is_none());
    }
}

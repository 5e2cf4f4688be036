//! # Simulated Bus Backend
//!
//! An in-memory one-wire network: a number of buses populated with DS18S20 thermometers
//! and DS2408 switches. Every bus transaction takes a configurable time, which makes the
//! backend useful to watch keep-alives and locking at work.
//!
//! ## Layout
//!
//! ```text
//! /                           every device, plus bus.N when the client asks for buses
//! /bus.0/10.67C6697351FF/     the same device, addressed through its bus
//! /10.67C6697351FF/temperature
//! /29.ABCDEF012345/PIO.3
//! /statistics/reads
//! /statistics/bus.0/locks     only with a shared lock registry, see `with_bus_stats`
//! ```
use std::{
    collections::BTreeMap,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
    thread,
    time::Duration,
};

use nix::errno::Errno;
use ownet_protocol::ControlFlags;
use ownet_server::{
    DeviceTree,
    locks::LockRegistry,
    query::{BusId, Change, DeviceId, DirEntry, Node, QueryContext, QueryResult},
};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Family {
    /// DS18S20 thermometer
    Thermometer,
    /// DS2408 eight channel switch
    Switch,
}

impl Family {
    fn code(&self) -> u8 {
        match self {
            Family::Thermometer => 0x10,
            Family::Switch => 0x29,
        }
    }

    fn type_name(&self) -> &'static str {
        match self {
            Family::Thermometer => "DS18S20",
            Family::Switch => "DS2408",
        }
    }

    fn properties(&self) -> Vec<Property> {
        let mut properties = vec![
            Property::Address,
            Property::Crc8,
            Property::Family,
            Property::Id,
            Property::Type,
        ];
        match self {
            Family::Thermometer => {
                properties.extend([Property::Temperature, Property::TempHigh, Property::TempLow])
            }
            Family::Switch => {
                properties.extend((0..8).map(Property::Pio));
                properties.push(Property::PioAll);
            }
        }
        properties
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Property {
    Address,
    Crc8,
    Family,
    Id,
    Type,
    Temperature,
    TempHigh,
    TempLow,
    Pio(u8),
    PioAll,
}

impl Property {
    fn name(&self) -> String {
        match self {
            Property::Address => "address".to_string(),
            Property::Crc8 => "crc8".to_string(),
            Property::Family => "family".to_string(),
            Property::Id => "id".to_string(),
            Property::Type => "type".to_string(),
            Property::Temperature => "temperature".to_string(),
            Property::TempHigh => "temphigh".to_string(),
            Property::TempLow => "templow".to_string(),
            Property::Pio(n) => format!("PIO.{}", n),
            Property::PioAll => "PIO.ALL".to_string(),
        }
    }

    fn change(&self) -> Change {
        match self {
            Property::Address
            | Property::Crc8
            | Property::Family
            | Property::Id
            | Property::Type => Change::Static,
            Property::Temperature => Change::Volatile,
            Property::TempHigh | Property::TempLow | Property::Pio(_) | Property::PioAll => {
                Change::Stable
            }
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Statistic {
    Reads,
    Writes,
    Searches,
}

impl Statistic {
    const ALL: [Statistic; 3] = [Statistic::Reads, Statistic::Writes, Statistic::Searches];

    fn name(&self) -> &'static str {
        match self {
            Statistic::Reads => "reads",
            Statistic::Writes => "writes",
            Statistic::Searches => "searches",
        }
    }
}

/// Usage of one bus lock, as counted by the server's lock registry.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum BusStatistic {
    Locks,
    /// Milliseconds the lock was held in total
    Held,
}

impl BusStatistic {
    const ALL: [BusStatistic; 2] = [BusStatistic::Locks, BusStatistic::Held];

    fn name(&self) -> &'static str {
        match self {
            BusStatistic::Locks => "locks",
            BusStatistic::Held => "held",
        }
    }
}

#[derive(Copy, Clone, Debug)]
struct Device {
    id: DeviceId,
    bus: BusId,
    family: Family,
}

/// What a path points at.
#[derive(Copy, Clone, Debug)]
enum Location {
    Root,
    Bus(BusId),
    Device(Device),
    Property(Device, Property),
    Statistics,
    Statistic(Statistic),
    BusStatistics(BusId),
    BusStatistic(BusId, BusStatistic),
}

/// Mutable state of one device.
#[derive(Clone, Debug)]
struct Registers {
    pio: [bool; 8],
    temp_high: f64,
    temp_low: f64,
    conversions: u64,
}

impl Default for Registers {
    fn default() -> Self {
        Registers {
            pio: [false; 8],
            temp_high: 75.0,
            temp_low: 10.0,
            conversions: 0,
        }
    }
}

#[derive(Debug)]
pub struct SimulatedBus {
    buses: u32,
    devices: Vec<Device>,
    latency: Duration,
    registers: Mutex<BTreeMap<DeviceId, Registers>>,
    reads: AtomicU64,
    writes: AtomicU64,
    searches: AtomicU64,
    locks: Option<Arc<LockRegistry>>,
}

/// The addresses used in the documentation come first, so they exist on every setup.
fn thermometer_id(n: usize) -> DeviceId {
    match n {
        0 => DeviceId::new(0x10, [0x67, 0xC6, 0x69, 0x73, 0x51, 0xFF]),
        n => DeviceId::new(0x10, [0x00, 0x08, 0x02, 0x4B, 0x00, n as u8]),
    }
}

fn switch_id(n: usize) -> DeviceId {
    match n {
        0 => DeviceId::new(0x29, [0xAB, 0xCD, 0xEF, 0x01, 0x23, 0x45]),
        n => DeviceId::new(0x29, [0x00, 0x00, 0x00, 0x11, 0x00, n as u8]),
    }
}

impl SimulatedBus {
    /// Spreads the devices over `buses` buses, round robin.
    pub fn new(buses: u32, thermometers: usize, switches: usize, latency: Duration) -> SimulatedBus {
        let buses = buses.max(1);
        let devices = (0..thermometers)
            .map(|n| (thermometer_id(n), Family::Thermometer))
            .chain((0..switches).map(|n| (switch_id(n), Family::Switch)))
            .enumerate()
            .map(|(i, (id, family))| Device {
                id,
                bus: BusId(i as u32 % buses),
                family,
            })
            .collect();
        log::debug!(
            "Simulating {} thermometers and {} switches on {} buses",
            thermometers,
            switches,
            buses
        );
        SimulatedBus {
            buses,
            devices,
            latency,
            registers: Mutex::new(BTreeMap::new()),
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            searches: AtomicU64::new(0),
            locks: None,
        }
    }

    /// Publishes the usage of every bus lock under `/statistics/bus.N/`. The registry has
    /// to be the one the server locks with, see `Builder::locks`.
    pub fn with_bus_stats(mut self, locks: Arc<LockRegistry>) -> SimulatedBus {
        self.locks = Some(locks);
        self
    }

    /// One bus transaction.
    fn transact(&self) {
        if !self.latency.is_zero() {
            thread::sleep(self.latency);
        }
    }

    fn registers<R>(&self, id: DeviceId, f: impl FnOnce(&mut Registers) -> R) -> R {
        let mut registers = self.registers.lock().unwrap_or_else(|e| e.into_inner());
        f(registers.entry(id).or_default())
    }

    fn find(&self, name: &str, bus: Option<BusId>) -> QueryResult<Device> {
        let id = DeviceId::parse(name).ok_or(Errno::ENOENT)?;
        self.devices
            .iter()
            .find(|device| device.id == id && bus.is_none_or(|bus| device.bus == bus))
            .copied()
            .ok_or(Errno::ENOENT)
    }

    /// `Some` for a `bus.N` name, an error if that bus does not exist.
    fn bus_name(&self, part: &str) -> Option<QueryResult<BusId>> {
        let index = part.strip_prefix("bus.")?;
        Some(match index.parse::<u32>() {
            Ok(index) if index < self.buses => Ok(BusId(index)),
            _ => Err(Errno::ENOENT),
        })
    }

    fn locate(&self, path: &str) -> QueryResult<Location> {
        let mut parts: Vec<&str> = path.split('/').filter(|part| !part.is_empty()).collect();
        let mut bus = None;
        if let Some(index) = parts.first().and_then(|first| self.bus_name(first)) {
            bus = Some(index?);
            parts.remove(0);
        }

        let location = match parts.as_slice() {
            [] => bus.map(Location::Bus).unwrap_or(Location::Root),
            ["statistics", rest @ ..] if bus.is_none() => self.locate_statistic(rest)?,
            [device] => Location::Device(self.find(device, bus)?),
            [device, property] => {
                let device = self.find(device, bus)?;
                let property = device
                    .family
                    .properties()
                    .into_iter()
                    .find(|p| p.name() == *property)
                    .ok_or(Errno::ENOENT)?;
                Location::Property(device, property)
            }
            _ => return Err(Errno::ENOENT),
        };
        Ok(location)
    }

    fn locate_statistic(&self, parts: &[&str]) -> QueryResult<Location> {
        let location = match parts {
            [] => Location::Statistics,
            [name] => match self.bus_name(name) {
                Some(bus) if self.locks.is_some() => Location::BusStatistics(bus?),
                Some(_) => return Err(Errno::ENOENT),
                None => Statistic::ALL
                    .iter()
                    .find(|stat| stat.name() == *name)
                    .map(|stat| Location::Statistic(*stat))
                    .ok_or(Errno::ENOENT)?,
            },
            [name, field] if self.locks.is_some() => {
                let bus = self.bus_name(name).ok_or(Errno::ENOENT)??;
                let field = BusStatistic::ALL
                    .iter()
                    .find(|stat| stat.name() == *field)
                    .ok_or(Errno::ENOENT)?;
                Location::BusStatistic(bus, *field)
            }
            _ => return Err(Errno::ENOENT),
        };
        Ok(location)
    }

    fn bus_statistic(&self, bus: BusId, field: BusStatistic) -> u128 {
        let stats = self
            .locks
            .as_ref()
            .and_then(|locks| locks.bus_stats(bus))
            .unwrap_or_default();
        match field {
            BusStatistic::Locks => stats.locks as u128,
            BusStatistic::Held => stats.held.as_millis(),
        }
    }

    fn temperature(&self, device: &Device) -> f64 {
        let conversions = self.registers(device.id, |r| {
            r.conversions += 1;
            r.conversions
        });
        let base = 18.0 + (device.id.as_bytes()[6] % 8) as f64;
        // Drifts in 1/16 degree steps, like the real sensor resolution
        base + ((conversions % 16) as f64) / 16.0
    }

    fn value(&self, device: &Device, property: Property, flags: ControlFlags) -> String {
        let scale = flags.temperature_scale();
        match property {
            Property::Address => device.id.name(ownet_protocol::DeviceFormat::FIC),
            Property::Crc8 => format!("{:02X}", device.id.crc()),
            Property::Family => format!("{:02X}", device.id.family()),
            Property::Id => device.id.name(ownet_protocol::DeviceFormat::FI)[2..].to_string(),
            Property::Type => device.family.type_name().to_string(),
            Property::Temperature => {
                format!("{:>12.4}", scale.from_celsius(self.temperature(device)))
            }
            Property::TempHigh => format!(
                "{:>12.4}",
                scale.from_celsius(self.registers(device.id, |r| r.temp_high))
            ),
            Property::TempLow => format!(
                "{:>12.4}",
                scale.from_celsius(self.registers(device.id, |r| r.temp_low))
            ),
            Property::Pio(n) => {
                let on = self.registers(device.id, |r| r.pio[n as usize]);
                if on { "1" } else { "0" }.to_string()
            }
            Property::PioAll => self.registers(device.id, |r| {
                r.pio
                    .iter()
                    .map(|on| if *on { "1" } else { "0" })
                    .collect::<Vec<_>>()
                    .join(",")
            }),
        }
    }

    fn store(&self, device: &Device, property: Property, text: &str) -> QueryResult<()> {
        let parse_bool = |text: &str| match text.trim() {
            "1" | "on" | "yes" => Ok(true),
            "0" | "off" | "no" => Ok(false),
            _ => Err(Errno::EINVAL),
        };
        match property {
            Property::Pio(n) => {
                let on = parse_bool(text)?;
                self.registers(device.id, |r| r.pio[n as usize] = on);
            }
            Property::PioAll => {
                let values = text
                    .split(',')
                    .map(parse_bool)
                    .collect::<QueryResult<Vec<_>>>()?;
                if values.len() != 8 {
                    return Err(Errno::EINVAL);
                }
                self.registers(device.id, |r| r.pio.copy_from_slice(&values));
            }
            Property::TempHigh | Property::TempLow => {
                let value: f64 = text.trim().parse().map_err(|_| Errno::EINVAL)?;
                self.registers(device.id, |r| {
                    if property == Property::TempHigh {
                        r.temp_high = value
                    } else {
                        r.temp_low = value
                    }
                });
            }
            _ => return Err(Errno::EROFS),
        }
        Ok(())
    }

    fn device_path(&self, device: &Device, bus: Option<BusId>, flags: ControlFlags) -> String {
        let name = device.id.name(flags.device_format());
        match bus {
            Some(bus) => format!("/{}/{}", bus, name),
            None => format!("/{}", name),
        }
    }
}

impl DeviceTree for SimulatedBus {
    fn resolve(&self, path: &str, _ctx: &QueryContext) -> QueryResult<Node> {
        let node = match self.locate(path)? {
            Location::Root | Location::Statistics | Location::BusStatistics(_) => {
                Node::directory(path)
            }
            Location::Bus(bus) => Node::directory(path).on_bus(bus),
            Location::Device(device) => Node::directory(path)
                .on_bus(device.bus)
                .of_device(device.id),
            Location::Property(device, property) => Node::property(path, property.change())
                .on_bus(device.bus)
                .of_device(device.id),
            Location::Statistic(_) | Location::BusStatistic(..) => {
                Node::property(path, Change::Statistic)
            }
        };
        Ok(node)
    }

    fn read(
        &self,
        node: &Node,
        ctx: &QueryContext,
        offset: usize,
        size: usize,
    ) -> QueryResult<Vec<u8>> {
        let text = match self.locate(&node.path)? {
            Location::Property(device, property) => {
                if property.change() != Change::Static {
                    self.transact();
                    self.reads.fetch_add(1, Ordering::Relaxed);
                }
                self.value(&device, property, ctx.flags)
            }
            Location::Statistic(stat) => {
                let counter = match stat {
                    Statistic::Reads => &self.reads,
                    Statistic::Writes => &self.writes,
                    Statistic::Searches => &self.searches,
                };
                format!("{:>12}", counter.load(Ordering::Relaxed))
            }
            Location::BusStatistic(bus, field) => {
                format!("{:>12}", self.bus_statistic(bus, field))
            }
            _ => return Err(Errno::EISDIR),
        };
        let bytes = text.into_bytes();
        if offset >= bytes.len() {
            return Ok(Vec::new());
        }
        let end = (offset + size).min(bytes.len());
        Ok(bytes[offset..end].to_vec())
    }

    fn write(
        &self,
        node: &Node,
        _ctx: &QueryContext,
        offset: usize,
        data: &[u8],
    ) -> QueryResult<()> {
        match self.locate(&node.path)? {
            Location::Property(device, property) => {
                if offset != 0 {
                    return Err(Errno::EINVAL);
                }
                let text = std::str::from_utf8(data).map_err(|_| Errno::EINVAL)?;
                let text = text.trim_end_matches('\0');
                self.transact();
                self.writes.fetch_add(1, Ordering::Relaxed);
                self.store(&device, property, text)
            }
            Location::Statistic(_) | Location::BusStatistic(..) => Err(Errno::EROFS),
            _ => Err(Errno::EISDIR),
        }
    }

    fn list(
        &self,
        node: &Node,
        ctx: &QueryContext,
        visit: &mut dyn FnMut(DirEntry),
    ) -> QueryResult<u32> {
        let flags = ctx.flags;
        match self.locate(&node.path)? {
            Location::Root => {
                self.searches.fetch_add(1, Ordering::Relaxed);
                for device in &self.devices {
                    self.transact();
                    visit(DirEntry::new(self.device_path(device, None, flags), true));
                }
                if flags.bus_return() {
                    for bus in 0..self.buses {
                        visit(DirEntry::new(format!("/{}", BusId(bus)), true));
                    }
                }
                visit(DirEntry::new("/statistics", true));
            }
            Location::Bus(bus) => {
                self.searches.fetch_add(1, Ordering::Relaxed);
                for device in self.devices.iter().filter(|d| d.bus == bus) {
                    self.transact();
                    visit(DirEntry::new(
                        self.device_path(device, Some(bus), flags),
                        true,
                    ));
                }
            }
            Location::Device(device) => {
                let base = node.path.trim_end_matches('/');
                for property in device.family.properties() {
                    visit(DirEntry::new(format!("{}/{}", base, property.name()), false));
                }
            }
            Location::Statistics => {
                for stat in Statistic::ALL {
                    visit(DirEntry::new(format!("/statistics/{}", stat.name()), false));
                }
                if self.locks.is_some() {
                    for bus in 0..self.buses {
                        visit(DirEntry::new(format!("/statistics/{}", BusId(bus)), true));
                    }
                }
            }
            Location::BusStatistics(bus) => {
                for field in BusStatistic::ALL {
                    visit(DirEntry::new(
                        format!("/statistics/{}/{}", bus, field.name()),
                        false,
                    ));
                }
            }
            Location::Property(..) | Location::Statistic(_) | Location::BusStatistic(..) => {
                return Err(Errno::ENOTDIR);
            }
        }
        Ok(0)
    }
}

#[cfg(test)]
mod test {
    use super::SimulatedBus;
    use nix::errno::Errno;
    use ownet_protocol::{ControlFlags, DeviceFormat, TemperatureScale};
    use ownet_server::{
        DeviceTree,
        locks::LockRegistry,
        query::{BusId, Change, DirEntry, NodeKind, QueryContext},
    };
    use std::{sync::Arc, time::Duration};

    fn bus() -> SimulatedBus {
        SimulatedBus::new(2, 2, 1, Duration::ZERO)
    }

    fn list(tree: &SimulatedBus, path: &str, ctx: &QueryContext) -> Vec<DirEntry> {
        let node = tree.resolve(path, ctx).unwrap();
        let mut entries = Vec::new();
        tree.list(&node, ctx, &mut |entry| entries.push(entry)).unwrap();
        entries
    }

    fn read(tree: &SimulatedBus, path: &str, ctx: &QueryContext) -> String {
        let node = tree.resolve(path, ctx).unwrap();
        String::from_utf8(tree.read(&node, ctx, 0, 100).unwrap()).unwrap()
    }

    #[test]
    fn root_lists_devices_and_optionally_buses() {
        let tree = bus();
        let ctx = QueryContext::default();
        let paths: Vec<_> = list(&tree, "/", &ctx).into_iter().map(|e| e.path).collect();
        assert!(paths.contains(&"/10.67C6697351FF".to_string()));
        assert!(paths.contains(&"/29.ABCDEF012345".to_string()));
        assert!(!paths.iter().any(|p| p.starts_with("/bus.")));

        let ctx = QueryContext {
            flags: ControlFlags::default().with(ControlFlags::BUS_RETURN, true),
            ..QueryContext::default()
        };
        let paths: Vec<_> = list(&tree, "/", &ctx).into_iter().map(|e| e.path).collect();
        assert!(paths.contains(&"/bus.1".to_string()));
    }

    #[test]
    fn devices_are_named_in_the_requested_format() {
        let tree = bus();
        let ctx = QueryContext {
            flags: ControlFlags::default().with_device_format(DeviceFormat::FI),
            ..QueryContext::default()
        };
        let paths: Vec<_> = list(&tree, "/", &ctx).into_iter().map(|e| e.path).collect();
        assert!(paths.contains(&"/1067C6697351FF".to_string()));
        // Any format resolves
        assert!(tree.resolve("/1067C6697351FF/type", &ctx).is_ok());
    }

    #[test]
    fn properties_carry_their_locking_needs() {
        let tree = bus();
        let ctx = QueryContext::default();
        let node = tree.resolve("/10.67C6697351FF/temperature", &ctx).unwrap();
        assert_eq!(node.kind, NodeKind::Property(Change::Volatile));
        assert_eq!(node.bus, Some(BusId(0)));
        assert!(node.device.is_some());
        let node = tree.resolve("/bus.0/10.67C6697351FF/type", &ctx).unwrap();
        assert_eq!(node.kind, NodeKind::Property(Change::Static));
        assert_eq!(
            tree.resolve("/bus.1/10.67C6697351FF", &ctx),
            Err(Errno::ENOENT)
        );
    }

    #[test]
    fn temperature_follows_the_scale() {
        let tree = bus();
        let celsius: f64 = read(&tree, "/10.67C6697351FF/templow", &QueryContext::default())
            .trim()
            .parse()
            .unwrap();
        let ctx = QueryContext {
            flags: ControlFlags::default().with_temperature_scale(TemperatureScale::Fahrenheit),
            ..QueryContext::default()
        };
        let fahrenheit: f64 = read(&tree, "/10.67C6697351FF/templow", &ctx)
            .trim()
            .parse()
            .unwrap();
        assert_eq!(celsius, 10.0);
        assert_eq!(fahrenheit, 50.0);
        assert_eq!(read(&tree, "/10.67C6697351FF/temperature", &ctx).len(), 12);
    }

    #[test]
    fn switches_can_be_written() {
        let tree = bus();
        let ctx = QueryContext::default();
        let node = tree.resolve("/29.ABCDEF012345/PIO.3", &ctx).unwrap();
        tree.write(&node, &ctx, 0, b"1").unwrap();
        assert_eq!(read(&tree, "/29.ABCDEF012345/PIO.ALL", &ctx), "0,0,0,1,0,0,0,0");
        let node = tree.resolve("/29.ABCDEF012345/type", &ctx).unwrap();
        assert_eq!(tree.write(&node, &ctx, 0, b"DS2409"), Err(Errno::EROFS));
        let node = tree.resolve("/29.ABCDEF012345/PIO.1", &ctx).unwrap();
        assert_eq!(tree.write(&node, &ctx, 0, b"maybe"), Err(Errno::EINVAL));
    }

    #[test]
    fn statistics_count_bus_traffic() {
        let tree = bus();
        let ctx = QueryContext::default();
        read(&tree, "/10.67C6697351FF/temperature", &ctx);
        read(&tree, "/10.67C6697351FF/temperature", &ctx);
        assert_eq!(read(&tree, "/statistics/reads", &ctx).trim(), "2");
    }

    #[tokio::test]
    async fn bus_statistics_come_from_the_lock_registry() {
        let locks = Arc::new(LockRegistry::new());
        let tree = bus().with_bus_stats(Arc::clone(&locks));
        let ctx = QueryContext::default();
        for _ in 0..2 {
            let _guard = locks.lock_bus(BusId(1)).await;
        }
        assert_eq!(read(&tree, "/statistics/bus.1/locks", &ctx).trim(), "2");
        assert_eq!(read(&tree, "/statistics/bus.0/locks", &ctx).trim(), "0");
        assert!(read(&tree, "/statistics/bus.1/held", &ctx).trim().parse::<u64>().is_ok());

        let paths: Vec<_> = list(&tree, "/statistics", &ctx).into_iter().map(|e| e.path).collect();
        assert!(paths.contains(&"/statistics/bus.1".to_string()));
        let node = tree.resolve("/statistics/bus.0/held", &ctx).unwrap();
        assert_eq!(node.kind, NodeKind::Property(Change::Statistic));
        assert_eq!(
            tree.resolve("/statistics/bus.2/locks", &ctx),
            Err(Errno::ENOENT)
        );
    }

    #[test]
    fn bus_statistics_need_a_registry() {
        let tree = bus();
        let ctx = QueryContext::default();
        assert_eq!(
            tree.resolve("/statistics/bus.0/locks", &ctx),
            Err(Errno::ENOENT)
        );
        let paths: Vec<_> = list(&tree, "/statistics", &ctx).into_iter().map(|e| e.path).collect();
        assert_eq!(paths.len(), 3);
    }
}

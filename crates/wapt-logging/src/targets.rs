//! Subsystem log targets. Events emitted with one of these targets are
//! routed to their own file in addition to the component log.

pub const T_IFACE: &str = "wapt::iface";
pub const T_SESSION: &str = "wapt::session";
pub const T_SERVICES: &str = "wapt::services";

pub(crate) const SUBSYSTEMS: [(&str, &str); 3] = [
    (T_IFACE, "iface.log"),
    (T_SESSION, "session.log"),
    (T_SERVICES, "services.log"),
];

/// File a subsystem target is routed to, if it has one.
pub fn subsystem_file(target: &str) -> Option<&'static str> {
    SUBSYSTEMS
        .iter()
        .find(|(name, _)| *name == target)
        .map(|(_, file)| *file)
}

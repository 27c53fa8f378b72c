#[macro_use]
extern crate error_chain;

pub mod bootstrap;
pub mod config;
pub mod nodetool;
pub mod recovery;
pub mod registry;
pub mod retry;

pub mod errors {
    // Create the Error, ErrorKind, ResultExt, and Result types
    error_chain! {
        foreign_links {
            Io(std::io::Error);
            Kube(kube::Error);
            Env(envy::Error);
        }

        errors {
            RegistryNotFound(name: String) {
                description("topology registry not found")
                display("topology registry configmap '{}' could not be found", name)
            }
            LockHeld(name: String, by: String) {
                description("registry lock held by another pod")
                display("cannot acquire lock for {}: pod {} has the lock", name, by)
            }
            Conflict(name: String) {
                description("concurrent modification")
                display("{} was modified concurrently", name)
            }
            NodetoolFailed(command: String, output: String) {
                description("nodetool command failed")
                display("nodetool {} failed: {}", command, output)
            }
            GossipStateMissing(output: String) {
                description("gossip state not found")
                display("failed to find gossip state in info output: {}", output)
            }
            OldNodeStillRunning(ip: String) {
                description("old node still running")
                display("tried to shut down old node {}, wait for retry", ip)
            }
            RejoinTimeout(ip: String) {
                description("timed out waiting for rejoin")
                display("timeout while waiting for {} to be registered", ip)
            }
            InvalidDuration(raw: String) {
                description("invalid duration")
                display("invalid duration '{}'", raw)
            }
            Usage(arg: String) {
                description("invalid arguments")
                display("unknown command '{}', expected one of: init, wait", arg)
            }
        }
    }

    impl Error {
        /// Errors which indicate a broken deployment rather than a transient condition.
        pub fn is_fatal(&self) -> bool {
            matches!(self.kind(), ErrorKind::RegistryNotFound(_) | ErrorKind::Env(_) | ErrorKind::Usage(_))
        }
    }
}

/*
Pod lifecycle around a Cassandra node replacement:

- The pod is rescheduled (node loss, eviction, or the recovery controller deleting it)
  and comes back with a new IP.
  - `cassandra-bootstrap init` compares the IP recorded in the topology configmap with
    the current one and, if the node never bootstrapped under the old IP, writes the
    replace marker so Cassandra starts with `replace_address`.
  - `cassandra-bootstrap wait` waits for the node to show up as UP and commits the new
    IP back into the configmap under the annotation lock.

- A pod stuck Unschedulable because its local PV is pinned to a node that no longer
  exists will never recover on its own.
  - `cassandra-recovery` detaches the PV, deletes the PVC and the pod, and lets the
    StatefulSet controller recreate both on a healthy node.
*/

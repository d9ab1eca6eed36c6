use std::sync::Arc;

use tq_sim::Config;

mod control_plane;
mod modes;
mod realpath;

const CONFIG: &str = r#"{
    "general": {
        "left_endpoint_ip": "10.0.1.2",
        "right_endpoint_ip": "10.0.2.2",
        "left_interface_address": "10.0.1.1/24",
        "right_interface_address": "10.0.2.1/24",
        "left_interface": "enp1s0",
        "right_interface": "enp2s0"
    },
    "extended": {
        "left_vlan": 100,
        "right_vlan": 200,
        "public_interface": {
            "address": "198.51.100.7/24",
            "gateway": "198.51.100.1",
            "vlan": 300
        },
        "right_netns_address": "10.0.3.1/24",
        "configs": [
            { "name": "Fiber", "vlan": 21, "address": "203.0.113.2/24", "gateway": "203.0.113.1" },
            { "name": "Satellite", "vlan": 22 }
        ]
    }
}"#;

fn config() -> Arc<Config> {
    Arc::new(CONFIG.parse().unwrap())
}

pub mod snapshot_map;

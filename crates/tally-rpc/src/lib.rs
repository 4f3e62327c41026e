pub mod api;
pub mod server;
pub mod types;

pub use server::{RpcServer, RpcServerState};
pub use types::{
    RpcAccount, RpcAssetNote, RpcBalance, RpcIdentity, RpcOrderRequest, RpcOrderResult, RpcTrade,
};

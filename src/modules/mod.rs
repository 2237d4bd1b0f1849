pub mod cache;
pub mod rate_limit;
pub mod websocket;

pub mod user {
    pub mod schema;
    pub mod model;
    pub mod identity;
    pub mod repository;
    pub mod repository_pg;
    pub mod handle;
    pub mod service;
    pub mod route;
}

pub mod conversation {
    pub mod schema;
    pub mod model;
    pub mod repository;
    pub mod repository_pg;
    pub mod handle;
    pub mod service;
    pub mod route;
}

pub mod message {
    pub mod schema;
    pub mod model;
    pub mod repository;
    pub mod repository_pg;
    pub mod handle;
    pub mod service;
    pub mod route;
}

pub mod presence {
    pub mod model;
    pub mod repository;
    pub mod repository_memory;
    pub mod repository_redis;
    pub mod service;
}

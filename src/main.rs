use actix::Actor;
use actix_cors::Cors;
use actix_web::{
    self, App, HttpServer,
    http::header,
    middleware::{Logger, from_fn},
    web,
};
use std::{sync::Arc, time::Duration};

use crate::{
    configs::{connect_database, connect_redis},
    constants::Env,
    middlewares::authentication,
    modules::{
        cache::{CacheService, Ttl, redis::RedisCache},
        conversation::{repository_pg::ConversationPgRepository, service::ConversationService},
        message::{repository_pg::MessageRepositoryPg, service::MessageService},
        presence::{
            repository::PresenceStore, repository_memory::MemoryPresenceStore,
            repository_redis::RedisPresenceStore, service::PresenceService,
        },
        rate_limit::{
            RateLimiter, memory::MemoryRateLimiter, redis::RedisRateLimiter,
            service::RateLimitService,
        },
        user::{
            identity::{IdentityProvider, JwtIdentityProvider},
            repository_pg::UserRepositoryPg,
            service::UserService,
        },
        websocket::{
            broadcaster::{Broadcaster, LocalBroadcaster, RedisBroadcaster, run_bus_listener},
            dispatch::Dispatcher,
            handler::websocket_handler,
            server::ChatHub,
            session::SessionSettings,
        },
    },
};

mod api;
mod configs;
mod constants;
mod middlewares;
mod modules;
#[cfg(test)]
mod test;
mod utils;

const LIMITER_SWEEP_EVERY: Duration = Duration::from_secs(60);

#[actix_web::get("/")]
async fn health_check() -> &'static str {
    "Server is running"
}

fn ttl(secs: u64) -> Ttl {
    Ttl::new(secs).unwrap_or(Ttl::MIN)
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    dotenvy::dotenv().ok();
    env_logger::init();
    let env = Env::from_env();
    log::info!("Environment variables loaded");

    let db_pool = connect_database(&env).await.map_err(|e| {
        log::error!("Database connection error: {e}");
        std::io::Error::other("Database connection error")
    })?;
    let redis_pool = connect_redis(&env).await;

    let hub = ChatHub::new().start();
    let mut background = Vec::new();

    let (cache, broadcaster, presence_store, limiter, memory_limiter): (
        CacheService,
        Arc<dyn Broadcaster>,
        Arc<dyn PresenceStore>,
        Arc<dyn RateLimiter>,
        Option<Arc<MemoryRateLimiter>>,
    ) = match (redis_pool, env.redis_url.clone()) {
        (Some(pool), Some(url)) => {
            background.push(actix_web::rt::spawn(run_bus_listener(url, hub.clone().recipient())));
            (
                CacheService::new(Arc::new(RedisCache::new(pool.clone()))),
                Arc::new(RedisBroadcaster::new(pool.clone())),
                Arc::new(RedisPresenceStore::new(pool.clone(), env.presence_ttl)),
                Arc::new(RedisRateLimiter::new(pool)),
                None,
            )
        }
        _ => {
            log::warn!("Cache disabled; presence, rate limits and fan-out are local to this instance");
            let memory_limiter = Arc::new(MemoryRateLimiter::new());
            (
                CacheService::disabled(),
                Arc::new(LocalBroadcaster::new(hub.clone().recipient())),
                Arc::new(MemoryPresenceStore::new()),
                memory_limiter.clone(),
                Some(memory_limiter),
            )
        }
    };

    let user_service = UserService::with_dependencies(
        Arc::new(UserRepositoryPg::new(db_pool.clone())),
        cache.clone(),
        ttl(env.profile_cache_ttl),
    );
    let message_repo = Arc::new(MessageRepositoryPg::new(db_pool.clone()));
    let conversation_service = ConversationService::with_dependencies(
        Arc::new(ConversationPgRepository::new(db_pool.clone())),
        message_repo.clone(),
        user_service.clone(),
        cache,
        broadcaster.clone(),
        ttl(env.conversation_cache_ttl),
    );
    let message_service = MessageService::with_dependencies(
        message_repo,
        conversation_service.clone(),
        broadcaster.clone(),
    );
    let presence_service =
        PresenceService::with_dependencies(presence_store, broadcaster.clone(), env.presence_ttl);
    let rate_limit_service = RateLimitService::with_dependencies(limiter, env.rate_limits);
    let dispatcher = Dispatcher::with_dependencies(
        message_service.clone(),
        conversation_service.clone(),
        presence_service.clone(),
        rate_limit_service.clone(),
        broadcaster,
    );

    background.push(presence_service.clone().spawn_sweeper(env.heartbeat_interval));
    if let Some(memory_limiter) = memory_limiter {
        background.push(memory_limiter.spawn_sweeper(LIMITER_SWEEP_EVERY, rate_limit_service.retention()));
    }

    let identities: Arc<dyn IdentityProvider> = Arc::new(JwtIdentityProvider::new(env.jwt_secret.clone()));
    let identities = web::Data::from(identities);
    let settings = SessionSettings::from(&env);
    let frontend_url = env.frontend_url.clone();

    log::info!("Starting server at http://{}:{}", env.ip, env.port);
    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allowed_origin(&frontend_url)
            .allowed_methods(vec!["GET", "POST", "PUT", "DELETE"])
            .allowed_headers(vec![header::AUTHORIZATION, header::CONTENT_TYPE])
            .supports_credentials()
            .max_age(3600);

        App::new()
            .wrap(cors)
            .wrap(Logger::default())
            .app_data(identities.clone())
            .app_data(web::Data::new(hub.clone()))
            .app_data(web::Data::new(user_service.clone()))
            .app_data(web::Data::new(conversation_service.clone()))
            .app_data(web::Data::new(message_service.clone()))
            .app_data(web::Data::new(presence_service.clone()))
            .app_data(web::Data::new(rate_limit_service.clone()))
            .app_data(web::Data::new(dispatcher.clone()))
            .app_data(web::Data::new(settings))
            .service(health_check)
            .route("/ws", web::get().to(websocket_handler))
            .service(
                web::scope("/api")
                    .wrap(from_fn(authentication))
                    .configure(modules::user::route::configure)
                    .configure(modules::conversation::route::configure)
                    .configure(modules::message::route::configure),
            )
    })
    .bind((env.ip.as_str(), env.port))?
    .workers(2)
    .run()
    .await;

    for task in background {
        task.abort();
    }
    server
}

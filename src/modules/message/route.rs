use actix_web::web::{scope, ServiceConfig};

use crate::modules::message::handle::*;

pub fn configure(cfg: &mut ServiceConfig) {
    cfg.service(
        scope("/messages")
            .service(get_message)
            .service(edit_message)
            .service(delete_message)
            .service(react)
            .service(unreact),
    )
    .service(scope("/search").service(search));
}

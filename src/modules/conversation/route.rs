use actix_web::web::{scope, ServiceConfig};

use crate::modules::conversation::handle::*;

pub fn configure(cfg: &mut ServiceConfig) {
    cfg.service(
        scope("/conversations")
            .service(get_conversations)
            .service(create_direct)
            .service(create_group)
            .service(get_conversation)
            .service(add_participant)
            .service(remove_participant)
            .service(get_messages)
            .service(post_message)
            .service(mark_read),
    );
}

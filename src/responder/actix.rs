use actix_web::{http::header::ContentType, web, HttpResponse};

use super::{ChallengeResponder, CHALLENGE_PATH_PREFIX};

/// Mounts the challenge endpoint on an actix-web app.
///
/// ```no_run
/// # fn app(responder: certkeeper::ChallengeResponder) {
/// use actix_web::{App, HttpServer};
///
/// let server = HttpServer::new(move || {
///     App::new().configure(certkeeper::responder::service(responder.clone()))
/// });
/// # drop(server);
/// # }
/// ```
pub fn service(responder: ChallengeResponder) -> impl Fn(&mut web::ServiceConfig) + Clone {
    move |cfg: &mut web::ServiceConfig| {
        cfg.app_data(web::Data::new(responder.clone())).route(
            &format!("{CHALLENGE_PATH_PREFIX}{{token}}"),
            web::get().to(respond),
        );
    }
}

async fn respond(
    responder: web::Data<ChallengeResponder>,
    token: web::Path<String>,
) -> HttpResponse {
    match responder.respond(&token).await {
        Ok(Some(key_authorization)) => HttpResponse::Ok()
            .content_type(ContentType::plaintext())
            .body(key_authorization),

        Ok(None) => HttpResponse::NotFound().finish(),

        Err(err) => {
            log::error!("failed to look up challenge {token}: {err:?}");
            HttpResponse::InternalServerError().finish()
        }
    }
}

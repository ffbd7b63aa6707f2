//! The REST façade. Handlers receive the wired [`Service`] and thread the
//! request-scoped user identity into the controller as a value; the
//! controller itself never looks at a request.

use std::sync::Arc;

use anyhow::anyhow;
use hyper::{Body, Request, Response, StatusCode};
use routerify::ext::RequestExt;
use routerify::Router;
use serde_json::Value;

use crate::generator::{madgraph, powheg};
use crate::gridpack::{GeneratorKind, Gridpack, GridpackData};
use crate::http::{
    json_request, json_response, message_response, plain_text_response, route_error_handler,
    ApiError, RouterBuilder,
};
use crate::resolver;
use crate::user::User;
use crate::Service;

pub fn make_router(service: Arc<Service>) -> RouterBuilder {
    Router::builder()
        .data(service)
        .put("/api/create", create_handler)
        .put("/api/create_approve", create_approve_handler)
        .post("/api/approve", approve_handler)
        .post("/api/reset", reset_handler)
        .post("/api/create_request", create_request_handler)
        .post("/api/mcm", force_request_handler)
        .delete("/api/delete", delete_handler)
        .get("/api/get", get_handler)
        .get("/api/get_fragment/:id", get_fragment_handler)
        .get("/api/get_run_card/:id", get_run_card_handler)
        .get("/api/get_customize_card/:id", get_customize_card_handler)
        .get("/api/tick", tick_handler)
        .get("/api/tick_repository", tick_repository_handler)
        .get("/api/system_info", system_info_handler)
        .get("/api/user", user_handler)
        .err_handler(route_error_handler)
}

fn get_service(request: &Request<Body>) -> &Arc<Service> {
    request
        .data::<Arc<Service>>()
        .expect("service is attached to every route")
}

fn request_user(request: &Request<Body>) -> User {
    let service = get_service(request);
    User::from_headers(request.headers(), &service.conf.authorized)
}

fn check_authorized(user: &User) -> Result<(), ApiError> {
    if user.authorized {
        Ok(())
    } else {
        Err(ApiError::Unauthorized)
    }
}

fn ok_message(message: impl Into<String>) -> Response<Body> {
    message_response(StatusCode::OK, message)
}

/// Body of intent endpoints: `{"_id": "<gridpack id>"}`.
fn id_from_body(body: &Value) -> Result<String, ApiError> {
    body.get("_id")
        .and_then(Value::as_str)
        .filter(|gridpack_id| !gridpack_id.is_empty())
        .map(str::to_string)
        .ok_or_else(|| ApiError::BadRequest(anyhow!("No ID")))
}

async fn load_gridpack(service: &Service, gridpack_id: &str) -> Result<Gridpack, ApiError> {
    let data = service
        .store
        .get(gridpack_id)
        .await
        .map_err(ApiError::InternalServerError)?
        .ok_or_else(|| ApiError::NotFound(format!("Gridpack {gridpack_id} does not exist")))?;
    Gridpack::make(data).map_err(ApiError::BadRequest)
}

async fn create_gridpack(
    request: &mut Request<Body>,
    approve_immediately: bool,
) -> Result<Response<Body>, ApiError> {
    let user = request_user(request);
    check_authorized(&user)?;
    let data: GridpackData = json_request(request).await?;
    let service = get_service(request).clone();

    let gridpack = Gridpack::make(data).map_err(ApiError::BadRequest)?;
    gridpack
        .validate(&service.repository.tree())
        .map_err(|message| ApiError::BadRequest(anyhow!(message)))?;

    let gridpack_id = service
        .controller
        .create(gridpack.data, &user)
        .await
        .map_err(ApiError::InternalServerError)?;
    if approve_immediately {
        service.controller.approve(&gridpack_id, &user);
    }
    service.scheduler.notify();
    Ok(ok_message(gridpack_id))
}

async fn create_handler(mut request: Request<Body>) -> Result<Response<Body>, ApiError> {
    create_gridpack(&mut request, false).await
}

async fn create_approve_handler(mut request: Request<Body>) -> Result<Response<Body>, ApiError> {
    create_gridpack(&mut request, true).await
}

async fn approve_handler(mut request: Request<Body>) -> Result<Response<Body>, ApiError> {
    let user = request_user(&request);
    check_authorized(&user)?;
    let body: Value = json_request(&mut request).await?;
    let gridpack_id = id_from_body(&body)?;
    let service = get_service(&request);
    load_gridpack(service, &gridpack_id).await?;
    service.controller.approve(&gridpack_id, &user);
    service.scheduler.notify();
    Ok(ok_message("OK"))
}

async fn reset_handler(mut request: Request<Body>) -> Result<Response<Body>, ApiError> {
    let user = request_user(&request);
    check_authorized(&user)?;
    let body: Value = json_request(&mut request).await?;
    let gridpack_id = id_from_body(&body)?;
    let service = get_service(&request);
    load_gridpack(service, &gridpack_id).await?;
    service.controller.reset(&gridpack_id, &user);
    service.scheduler.notify();
    Ok(ok_message("OK"))
}

async fn create_request_handler(mut request: Request<Body>) -> Result<Response<Body>, ApiError> {
    let user = request_user(&request);
    check_authorized(&user)?;
    let body: Value = json_request(&mut request).await?;
    let gridpack_id = id_from_body(&body)?;
    let service = get_service(&request);
    load_gridpack(service, &gridpack_id).await?;
    service.controller.create_request(&gridpack_id, &user);
    service.scheduler.notify();
    Ok(ok_message("OK"))
}

/// Force request creation, e.g. after the downstream service lost one.
async fn force_request_handler(request: Request<Body>) -> Result<Response<Body>, ApiError> {
    let user = request_user(&request);
    check_authorized(&user)?;
    let gridpack_id = query_param(&request, "gridpack_id")
        .ok_or_else(|| ApiError::BadRequest(anyhow!("No gridpack_id")))?;
    let service = get_service(&request);
    load_gridpack(service, &gridpack_id).await?;
    service.controller.create_request(&gridpack_id, &user);
    service.scheduler.notify();
    Ok(ok_message("OK"))
}

async fn delete_handler(mut request: Request<Body>) -> Result<Response<Body>, ApiError> {
    let user = request_user(&request);
    check_authorized(&user)?;
    let body: Value = json_request(&mut request).await?;
    let gridpack_id = id_from_body(&body)?;
    let service = get_service(&request);
    service.controller.delete(&gridpack_id, &user);
    service.scheduler.notify();
    Ok(ok_message("OK"))
}

async fn get_handler(request: Request<Body>) -> Result<Response<Body>, ApiError> {
    let service = get_service(&request);
    let gridpacks = service
        .store
        .get_all()
        .await
        .map_err(ApiError::InternalServerError)?;
    json_response(StatusCode::OK, gridpacks)
}

async fn get_fragment_handler(request: Request<Body>) -> Result<Response<Body>, ApiError> {
    let gridpack_id = path_param(&request, "id")?;
    let service = get_service(&request);
    let mut gridpack = load_gridpack(service, &gridpack_id).await?;

    let (archive_path, effective_id) =
        resolver::effective_artifact(service.store.as_ref(), &service.conf, &mut gridpack)
            .await
            .map_err(ApiError::BadRequest)?;
    let fragment = crate::generator::fragment::FragmentBuilder::new(&service.repository)
        .build_fragment(&gridpack, &archive_path)
        .map_err(ApiError::InternalServerError)?;
    Ok(plain_text_response(label_with_ids(
        &gridpack_id,
        &effective_id,
        &fragment,
    )))
}

async fn get_run_card_handler(request: Request<Body>) -> Result<Response<Body>, ApiError> {
    let gridpack_id = path_param(&request, "id")?;
    let service = get_service(&request);
    let gridpack = load_gridpack(service, &gridpack_id).await?;
    let dataset = service
        .repository
        .dataset_card(&gridpack)
        .map_err(ApiError::InternalServerError)?;
    let campaign = service
        .repository
        .campaign_card(&gridpack)
        .map_err(ApiError::InternalServerError)?;

    let run_card = match gridpack.kind() {
        GeneratorKind::MadGraph => {
            madgraph::run_card_contents(&gridpack, &service.conf, &dataset, &campaign)
        }
        GeneratorKind::Powheg => {
            powheg::steering_contents(&gridpack, &service.conf, &dataset, &campaign)
        }
    }
    .map_err(ApiError::InternalServerError)?;
    Ok(plain_text_response(label_with_ids(
        &gridpack_id,
        &gridpack_id,
        &run_card,
    )))
}

async fn get_customize_card_handler(request: Request<Body>) -> Result<Response<Body>, ApiError> {
    let gridpack_id = path_param(&request, "id")?;
    let service = get_service(&request);
    let gridpack = load_gridpack(service, &gridpack_id).await?;
    let dataset = service
        .repository
        .dataset_card(&gridpack)
        .map_err(ApiError::InternalServerError)?;
    let campaign = service
        .repository
        .campaign_card(&gridpack)
        .map_err(ApiError::InternalServerError)?;

    let customize_card = match gridpack.kind() {
        GeneratorKind::MadGraph => {
            madgraph::customize_card_contents(&gridpack, &service.conf, &dataset, &campaign)
                .map_err(ApiError::InternalServerError)?
        }
        GeneratorKind::Powheg => None,
    };
    match customize_card {
        Some(contents) => Ok(plain_text_response(label_with_ids(
            &gridpack_id,
            &gridpack_id,
            &contents,
        ))),
        None => Err(ApiError::NotFound(format!(
            "Gridpack {gridpack_id} has no customize card"
        ))),
    }
}

async fn tick_handler(request: Request<Body>) -> Result<Response<Body>, ApiError> {
    let user = request_user(&request);
    check_authorized(&user)?;
    get_service(&request).scheduler.notify();
    Ok(ok_message("OK"))
}

async fn tick_repository_handler(request: Request<Body>) -> Result<Response<Body>, ApiError> {
    let user = request_user(&request);
    check_authorized(&user)?;
    get_service(&request).scheduler.notify();
    Ok(ok_message("OK"))
}

async fn system_info_handler(request: Request<Body>) -> Result<Response<Body>, ApiError> {
    let service = get_service(&request);
    json_response(
        StatusCode::OK,
        serde_json::json!({
            "last_tick": service.controller.last_tick(),
            "last_repository_tick": service.repository.last_refresh(),
            "options": service.repository.tree(),
            "gen_repository": service.conf.gen_repository,
        }),
    )
}

async fn user_handler(request: Request<Body>) -> Result<Response<Body>, ApiError> {
    let user = request_user(&request);
    json_response(StatusCode::OK, user)
}

fn path_param(request: &Request<Body>, name: &str) -> Result<String, ApiError> {
    request
        .param(name)
        .cloned()
        .ok_or_else(|| ApiError::BadRequest(anyhow!("missing path parameter {name}")))
}

fn query_param(request: &Request<Body>, name: &str) -> Option<String> {
    request.uri().query()?.split('&').find_map(|pair| {
        let (key, value) = pair.split_once('=')?;
        (key == name && !value.is_empty()).then(|| value.to_string())
    })
}

/// Header every served card and fragment carries, tying the text to the
/// document (and the producing document, when an artifact was reused).
fn label_with_ids(gridpack_id: &str, effective_id: &str, content: &str) -> String {
    let mut labeled = format!("# Related to Gridpack ID: {effective_id}\n");
    if gridpack_id != effective_id {
        labeled.push_str(&format!(
            "# Gridpack that reused this artifact: {gridpack_id}\n"
        ));
    }
    labeled.push('\n');
    labeled.push_str(content);
    labeled
}

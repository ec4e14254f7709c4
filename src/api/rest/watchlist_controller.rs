use super::form::MultipartForm;
use super::{ApiError, ApiResult, AppState};
use crate::db::models::watchlist_models::{PersonUpdate, WatchlistEntry, WatchlistGroup};
use axum::extract::{Multipart, Path, State};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

pub fn create_router() -> Router<AppState> {
    Router::new()
        .route("/api/watchlist", get(list_watchlist))
        .route("/api/watchlist/groups", get(list_groups).post(create_group))
        .route("/api/watchlist/person", post(create_person))
        .route("/api/watchlist/person_image", post(add_person_image))
        .route(
            "/api/watchlist/person/:id",
            put(update_person).delete(delete_person),
        )
}

#[derive(Debug, Serialize)]
pub struct GroupsResponse {
    pub groups: Vec<WatchlistGroup>,
}

#[derive(Debug, Deserialize)]
pub struct CreateGroupRequest {
    pub name: String,
}

#[derive(Debug, Serialize)]
pub struct GroupResponse {
    pub id: i64,
    pub name: String,
}

async fn list_groups(State(state): State<AppState>) -> ApiResult<Json<GroupsResponse>> {
    Ok(Json(GroupsResponse {
        groups: state.watchlist.groups().await?,
    }))
}

async fn create_group(
    State(state): State<AppState>,
    Json(request): Json<CreateGroupRequest>,
) -> ApiResult<Json<GroupResponse>> {
    let group = state.watchlist.create_group(&request.name).await?;
    Ok(Json(GroupResponse {
        id: group.id,
        name: group.name,
    }))
}

#[derive(Debug, Deserialize)]
pub struct CreatePersonRequest {
    pub name: String,
    pub group_id: Option<i64>,
    pub note: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct PersonResponse {
    pub id: i64,
    pub name: String,
    pub group_id: Option<i64>,
}

async fn create_person(
    State(state): State<AppState>,
    Json(request): Json<CreatePersonRequest>,
) -> ApiResult<Json<PersonResponse>> {
    let person = state
        .watchlist
        .create_person(&request.name, request.group_id, request.note.as_deref())
        .await?;
    Ok(Json(PersonResponse {
        id: person.id,
        name: person.name,
        group_id: person.group_id,
    }))
}

#[derive(Debug, Serialize)]
pub struct EnrolledImage {
    pub ok: bool,
    pub relpath: String,
}

async fn add_person_image(
    State(state): State<AppState>,
    multipart: Multipart,
) -> ApiResult<Json<EnrolledImage>> {
    let form = MultipartForm::read(multipart).await?;
    person_image_from_form(&state, form).await.map(Json)
}

pub async fn person_image_from_form(
    state: &AppState,
    form: MultipartForm,
) -> ApiResult<EnrolledImage> {
    let person_id: i64 = form
        .parse_opt("person_id")?
        .ok_or_else(|| ApiError::bad_request("person_id is required"))?;
    let image = form
        .file("image")
        .ok_or_else(|| ApiError::bad_request("image is required"))?;

    let relpath = state
        .watchlist
        .enroll(person_id, image.file_name.as_deref(), image.bytes.clone())
        .await?;
    Ok(EnrolledImage { ok: true, relpath })
}

#[derive(Debug, Serialize)]
pub struct PersonAck {
    pub ok: bool,
    pub id: i64,
}

async fn update_person(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(update): Json<PersonUpdate>,
) -> ApiResult<Json<PersonAck>> {
    state.watchlist.update_person(id, update).await?;
    Ok(Json(PersonAck { ok: true, id }))
}

async fn delete_person(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<Json<PersonAck>> {
    state.watchlist.delete_person(id).await?;
    Ok(Json(PersonAck { ok: true, id }))
}

#[derive(Debug, Serialize)]
pub struct WatchlistResponse {
    pub watchlist: Vec<WatchlistEntry>,
}

async fn list_watchlist(State(state): State<AppState>) -> ApiResult<Json<WatchlistResponse>> {
    Ok(Json(WatchlistResponse {
        watchlist: state.watchlist.list().await?,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::rest::testing::test_app;
    use crate::media::imaging::encode_jpeg;
    use image::RgbImage;

    fn jpeg() -> Vec<u8> {
        encode_jpeg(&RgbImage::new(160, 160), 90).unwrap()
    }

    #[tokio::test]
    async fn enrol_list_rename_and_delete() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_app(dir.path()).await;

        let Json(group) = create_group(
            State(app.state.clone()),
            Json(CreateGroupRequest {
                name: "Staff".to_string(),
            }),
        )
        .await
        .unwrap();
        let Json(groups) = list_groups(State(app.state.clone())).await.unwrap();
        assert_eq!(groups.groups.len(), 1);

        let Json(person) = create_person(
            State(app.state.clone()),
            Json(CreatePersonRequest {
                name: "Alice".to_string(),
                group_id: Some(group.id),
                note: None,
            }),
        )
        .await
        .unwrap();
        assert_eq!(person.group_id, Some(group.id));

        let form = MultipartForm::default()
            .with_field("person_id", &person.id.to_string())
            .with_file("image", "alice.jpg", jpeg());
        let enrolled = person_image_from_form(&app.state, form).await.unwrap();
        assert!(enrolled.ok);
        assert!(dir.path().join(&enrolled.relpath).exists());

        let Json(listing) = list_watchlist(State(app.state.clone())).await.unwrap();
        assert_eq!(listing.watchlist.len(), 1);
        assert_eq!(listing.watchlist[0].embeddings, 1);

        let update = PersonUpdate {
            name: Some("Alice B".to_string()),
            ..PersonUpdate::default()
        };
        let Json(ack) = update_person(State(app.state.clone()), Path(person.id), Json(update))
            .await
            .unwrap();
        assert!(ack.ok);

        delete_person(State(app.state.clone()), Path(person.id))
            .await
            .unwrap();
        let Json(listing) = list_watchlist(State(app.state.clone())).await.unwrap();
        assert!(listing.watchlist.is_empty());
        assert!(!dir.path().join(&enrolled.relpath).exists());

        let err = delete_person(State(app.state.clone()), Path(person.id))
            .await
            .unwrap_err();
        assert_eq!(err.status, 404);
        app.state.jobs.shutdown().await;
    }

    #[tokio::test]
    async fn person_image_form_is_validated() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_app(dir.path()).await;

        let form = MultipartForm::default().with_file("image", "x.jpg", jpeg());
        let err = person_image_from_form(&app.state, form).await.unwrap_err();
        assert_eq!(err.status, 400);

        let form = MultipartForm::default()
            .with_field("person_id", "abc")
            .with_file("image", "x.jpg", jpeg());
        let err = person_image_from_form(&app.state, form).await.unwrap_err();
        assert_eq!(err.status, 400);

        let form = MultipartForm::default().with_field("person_id", "42");
        let err = person_image_from_form(&app.state, form).await.unwrap_err();
        assert_eq!(err.status, 400);

        let form = MultipartForm::default()
            .with_field("person_id", "42")
            .with_file("image", "x.jpg", jpeg());
        let err = person_image_from_form(&app.state, form).await.unwrap_err();
        assert_eq!(err.status, 404);

        let err = create_group(
            State(app.state.clone()),
            Json(CreateGroupRequest {
                name: "  ".to_string(),
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status, 400);
        app.state.jobs.shutdown().await;
    }
}

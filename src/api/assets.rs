//! Static asset origin.

use std::path::{Component, Path, PathBuf};

use actix_web::{web, HttpResponse, Resource};

use crate::{error::Error, service::Service};

const INDEX_FILE_NAME: &str = "index.html";

/// Maps a request path onto a file under `root`, refusing anything that would escape it.
fn resolve(root: &Path, request: &str) -> Option<PathBuf> {
    let mut path = root.to_path_buf();

    for component in Path::new(request.trim_start_matches('/')).components() {
        match component {
            Component::Normal(part) => path.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }

    Some(path)
}

async fn serve_file(
    service: web::Data<Service>,
    path: web::Path<String>,
) -> actix_web::Result<HttpResponse> {
    let root = service
        .config()
        .static_dir
        .as_deref()
        .ok_or_else(|| Error::not_found(format!("asset /{path}")))?;

    let mut file = resolve(Path::new(root), &path)
        .ok_or_else(|| Error::not_found(format!("asset /{path}")))?;

    if tokio::fs::metadata(&file)
        .await
        .map(|m| m.is_dir())
        .unwrap_or(false)
    {
        file.push(INDEX_FILE_NAME);
    }

    let data = match tokio::fs::read(&file).await {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(Error::not_found(format!("asset /{path}")).into())
        }
        Err(e) => return Err(Error::internal(e).into()),
    };

    let mime = mime_guess::from_path(&file).first_or_octet_stream();

    Ok(HttpResponse::Ok()
        .content_type(mime.as_ref())
        .body(data))
}

pub fn service() -> Resource {
    web::resource("/{path:.*}").route(web::get().to(serve_file))
}

#[cfg(test)]
mod tests {
    use actix_web::{http::StatusCode, test, App};

    use crate::{config::Config, service::tests::memory_config};

    use super::*;

    #[actix_web::test]
    async fn test_resolve_rejects_traversal() {
        let root = Path::new("/srv/www");

        assert_eq!(resolve(root, "/app.js"), Some(PathBuf::from("/srv/www/app.js")));
        assert_eq!(
            resolve(root, "css/./site.css"),
            Some(PathBuf::from("/srv/www/css/site.css"))
        );
        assert_eq!(resolve(root, "/../etc/passwd"), None);
        assert_eq!(resolve(root, "css/../../secret"), None);
    }

    #[actix_web::test]
    async fn test_serves_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("index.html"), "<h1>sluice</h1>").unwrap();
        std::fs::write(dir.path().join("app.js"), "console.log(1)").unwrap();

        let config = Config {
            static_dir: Some(dir.path().to_string_lossy().into_owned()),
            ..memory_config()
        };
        let service = Service::connect().config(config).call().await.unwrap();

        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(service))
                .service(super::service()),
        )
        .await;

        let res = test::call_service(&app, test::TestRequest::get().uri("/").to_request()).await;
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(
            res.headers().get("content-type").unwrap(),
            "text/html"
        );
        assert_eq!(test::read_body(res).await, "<h1>sluice</h1>");

        let res =
            test::call_service(&app, test::TestRequest::get().uri("/app.js").to_request()).await;
        assert_eq!(res.status(), StatusCode::OK);

        let res =
            test::call_service(&app, test::TestRequest::get().uri("/missing.css").to_request())
                .await;
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
    }

    #[actix_web::test]
    async fn test_no_static_dir() {
        let service = Service::connect().config(memory_config()).call().await.unwrap();
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(service))
                .service(super::service()),
        )
        .await;

        let res = test::call_service(&app, test::TestRequest::get().uri("/").to_request()).await;
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
    }
}

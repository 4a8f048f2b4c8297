mod error;

pub use error::{ClientError, Result};
use accounts_types::{CreateUser, ListUsersQuery, Login, Token, UpdateUser, User, UserPage};
use serde::de::DeserializeOwned;

pub struct Client {
    http: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl Client {
    pub fn new(base_url: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url,
            token: None,
        }
    }

    pub fn with_token(mut self, token: String) -> Self {
        self.token = Some(token);
        self
    }

    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> Result<reqwest::RequestBuilder> {
        let token = self.token.as_ref().ok_or(ClientError::Unauthenticated)?;
        Ok(request.bearer_auth(token))
    }

    pub async fn create_user(&self, user: CreateUser) -> Result<User> {
        let url = format!("{}/v1/users", self.base_url);
        let response = self.http.post(&url).json(&user).send().await?;
        parse(response).await
    }

    /// Log in and keep the issued token for later calls.
    pub async fn login(&mut self, email: String, password: String) -> Result<Token> {
        let url = format!("{}/v1/users/login", self.base_url);
        let response = self
            .http
            .post(&url)
            .json(&Login { email, password })
            .send()
            .await?;
        let token: Token = parse(response).await?;
        self.token = Some(token.token.clone());
        Ok(token)
    }

    pub async fn get_user(&self, id: String) -> Result<User> {
        let url = format!("{}/v1/users/{}", self.base_url, id);
        let response = self.authorized(self.http.get(&url))?.send().await?;
        parse(response).await
    }

    pub async fn list_users(&self, query: ListUsersQuery) -> Result<UserPage> {
        let url = format!("{}/v1/users", self.base_url);
        let mut params = vec![];
        if let Some(page) = query.page {
            params.push(("page", page));
        }
        if let Some(limit) = query.limit {
            params.push(("limit", limit));
        }
        let response = self
            .authorized(self.http.get(&url).query(&params))?
            .send()
            .await?;
        parse(response).await
    }

    pub async fn update_user(&self, id: String, update: UpdateUser) -> Result<User> {
        let url = format!("{}/v1/users/{}", self.base_url, id);
        let response = self
            .authorized(self.http.put(&url).json(&update))?
            .send()
            .await?;
        parse(response).await
    }

    pub async fn delete_user(&self, id: String) -> Result<()> {
        let url = format!("{}/v1/users/{}", self.base_url, id);
        let response = self.authorized(self.http.delete(&url))?.send().await?;

        if !response.status().is_success() {
            return Err(http_error(response).await);
        }
        Ok(())
    }
}

async fn http_error(response: reqwest::Response) -> ClientError {
    ClientError::Http {
        status: response.status().as_u16(),
        message: response.text().await.unwrap_or_default(),
    }
}

async fn parse<T: DeserializeOwned>(response: reqwest::Response) -> Result<T> {
    if !response.status().is_success() {
        return Err(http_error(response).await);
    }

    response
        .json()
        .await
        .map_err(|e| ClientError::Deserialization(e.to_string()))
}
